//! Element locators and the actions that can be performed on them.
//!
//! A `Locator` is a chain of steps; each step narrows the matches of the
//! previous one. The chain is serialized to JSON and resolved in the page by
//! `locator.js`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocatorStep {
    Css { selector: String },
    Text { text: String, exact: bool },
    Role { role: String, name: Option<String>, exact: bool },
    Placeholder { text: String, exact: bool },
    Label { text: String, exact: bool },
    TestId { id: String },
    AltText { text: String, exact: bool },
    Title { text: String, exact: bool },
    Filter { has_text: Option<String>, has_not_text: Option<String> },
    First,
    Last,
    /// Negative indices count from the end.
    Nth { index: i64 },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Locator {
    pub steps: Vec<LocatorStep>,
}

impl Locator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn css(selector: impl Into<String>) -> Self {
        Self::new().then(LocatorStep::Css { selector: selector.into() })
    }

    pub fn then(mut self, step: LocatorStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn exact_suffix(exact: bool) -> &'static str {
    if exact {
        ", exact=True"
    } else {
        ""
    }
}

impl fmt::Display for LocatorStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css { selector } => write!(f, "locator({})", quote(selector)),
            Self::Text { text, exact } => write!(f, "get_by_text({}{})", quote(text), exact_suffix(*exact)),
            Self::Role { role, name, exact } => match name {
                Some(name) => write!(f, "get_by_role({}, name={}{})", quote(role), quote(name), exact_suffix(*exact)),
                None => write!(f, "get_by_role({})", quote(role)),
            },
            Self::Placeholder { text, exact } => {
                write!(f, "get_by_placeholder({}{})", quote(text), exact_suffix(*exact))
            }
            Self::Label { text, exact } => write!(f, "get_by_label({}{})", quote(text), exact_suffix(*exact)),
            Self::TestId { id } => write!(f, "get_by_test_id({})", quote(id)),
            Self::AltText { text, exact } => write!(f, "get_by_alt_text({}{})", quote(text), exact_suffix(*exact)),
            Self::Title { text, exact } => write!(f, "get_by_title({}{})", quote(text), exact_suffix(*exact)),
            Self::Filter { has_text, has_not_text } => {
                let mut parts = Vec::new();
                if let Some(t) = has_text {
                    parts.push(format!("has_text={}", quote(t)));
                }
                if let Some(t) = has_not_text {
                    parts.push(format!("has_not_text={}", quote(t)));
                }
                write!(f, "filter({})", parts.join(", "))
            }
            Self::First => f.write_str("first"),
            Self::Last => f.write_str("last"),
            Self::Nth { index } => write!(f, "nth({})", index),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.steps.iter().map(|s| s.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitState {
    Attached,
    Detached,
    Visible,
    Hidden,
}

impl WaitState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attached" => Some(Self::Attached),
            "detached" => Some(Self::Detached),
            "visible" => Some(Self::Visible),
            "hidden" => Some(Self::Hidden),
            _ => None,
        }
    }

    /// Whether a probe of `count` matches with `visible` state satisfies the wait.
    pub fn satisfied(&self, count: u64, visible: bool) -> bool {
        match self {
            Self::Attached => count > 0,
            Self::Detached => count == 0,
            Self::Visible => count > 0 && visible,
            Self::Hidden => count == 0 || !visible,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementAction {
    Click,
    DoubleClick,
    Fill(String),
    Type(String),
    Press(String),
    Check,
    Uncheck,
    SelectOption(Vec<String>),
    Hover,
    Focus,
    WaitFor(WaitState),
    IsVisible,
    TextContent,
    InputValue,
}

impl ElementAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::DoubleClick => "dblclick",
            Self::Fill(_) => "fill",
            Self::Type(_) => "type",
            Self::Press(_) => "press",
            Self::Check => "check",
            Self::Uncheck => "uncheck",
            Self::SelectOption(_) => "select_option",
            Self::Hover => "hover",
            Self::Focus => "focus",
            Self::WaitFor(_) => "wait_for",
            Self::IsVisible => "is_visible",
            Self::TextContent => "text_content",
            Self::InputValue => "input_value",
        }
    }

    /// Actions that change page state and may trigger network activity.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Click
                | Self::DoubleClick
                | Self::Fill(_)
                | Self::Type(_)
                | Self::Press(_)
                | Self::Check
                | Self::Uncheck
                | Self::SelectOption(_)
        )
    }

    /// Actions that need exactly one visible match before they run.
    pub fn needs_actionable_target(&self) -> bool {
        !matches!(self, Self::WaitFor(_) | Self::IsVisible | Self::TextContent | Self::InputValue)
    }
}
