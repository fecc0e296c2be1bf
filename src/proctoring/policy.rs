// Classification of raw browser signals into violations and soft warnings

use crate::config::ProctoringConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rule-breaks that count toward auto-submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    FullscreenExit,
    TabSwitch,
    EscapeKey,
    KeyboardShortcut,
    DevTools,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationKind::FullscreenExit => "fullscreen_exit",
            ViolationKind::TabSwitch => "tab_switch",
            ViolationKind::EscapeKey => "escape_key",
            ViolationKind::KeyboardShortcut => "keyboard_shortcut",
            ViolationKind::DevTools => "dev_tools",
        };
        f.write_str(name)
    }
}

impl ViolationKind {
    // Leaving fullscreen by switching windows raises both signals at once.
    pub fn debounce_group(self) -> ViolationKind {
        match self {
            ViolationKind::TabSwitch => ViolationKind::FullscreenExit,
            other => other,
        }
    }
}

/// Tracked but never counted against the violation limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftSignal {
    Copy,
    Paste,
    Cut,
    SelectAll,
    RightClick,
}

impl SoftSignal {
    pub fn toast(self) -> &'static str {
        match self {
            SoftSignal::Copy => "Copying is disabled during the interview",
            SoftSignal::Paste => "Pasting is disabled during the interview",
            SoftSignal::Cut => "Cutting text is disabled during the interview",
            SoftSignal::SelectAll => "Select-all is disabled during the interview",
            SoftSignal::RightClick => "Right-click is disabled during the interview",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipboardAction {
    Copy,
    Paste,
    Cut,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPress {
    pub key: String,
    #[serde(default)]
    pub meta: bool,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub shift: bool,
    /// Focus is inside the embedded code editor.
    #[serde(default)]
    pub in_code_editor: bool,
}

impl KeyPress {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    pub fn alt(mut self) -> Self {
        self.alt = true;
        self
    }

    pub fn in_editor(mut self) -> Self {
        self.in_code_editor = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum BrowserSignal {
    FullscreenExit,
    VisibilityHidden,
    Key(KeyPress),
    ContextMenu,
    Clipboard { action: ClipboardAction },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Violation(ViolationKind),
    Soft(SoftSignal),
    Allowed,
}

pub fn classify(signal: &BrowserSignal, config: &ProctoringConfig) -> Classification {
    match signal {
        BrowserSignal::FullscreenExit => Classification::Violation(ViolationKind::FullscreenExit),
        BrowserSignal::VisibilityHidden if config.count_tab_switch => {
            Classification::Violation(ViolationKind::TabSwitch)
        }
        BrowserSignal::VisibilityHidden => Classification::Allowed,
        BrowserSignal::ContextMenu => Classification::Soft(SoftSignal::RightClick),
        BrowserSignal::Clipboard { action } => Classification::Soft(match action {
            ClipboardAction::Copy => SoftSignal::Copy,
            ClipboardAction::Paste => SoftSignal::Paste,
            ClipboardAction::Cut => SoftSignal::Cut,
        }),
        BrowserSignal::Key(press) => classify_key(press),
    }
}

fn classify_key(press: &KeyPress) -> Classification {
    let key = press.key.to_ascii_lowercase();

    if key == "escape" || key == "esc" {
        return if press.in_code_editor {
            Classification::Allowed
        } else {
            Classification::Violation(ViolationKind::EscapeKey)
        };
    }

    if is_devtools_combo(&key, press) {
        return Classification::Violation(ViolationKind::DevTools);
    }

    if key == "printscreen" {
        return Classification::Violation(ViolationKind::KeyboardShortcut);
    }

    if press.ctrl || press.meta {
        let soft = match key.as_str() {
            "c" => Some(SoftSignal::Copy),
            "v" => Some(SoftSignal::Paste),
            "x" => Some(SoftSignal::Cut),
            "a" => Some(SoftSignal::SelectAll),
            _ => None,
        };
        if let Some(soft) = soft {
            return Classification::Soft(soft);
        }
    }

    if press.meta || key == "meta" || key == "os" {
        return Classification::Violation(ViolationKind::KeyboardShortcut);
    }

    Classification::Allowed
}

fn is_devtools_combo(key: &str, press: &KeyPress) -> bool {
    if key == "f12" {
        return true;
    }
    let inspector_key = matches!(key, "i" | "j" | "c");
    // Ctrl+Shift+I/J/C on Windows/Linux, Cmd+Alt+I/J/C on macOS
    (press.ctrl && press.shift && inspector_key) || (press.meta && press.alt && inspector_key)
}
