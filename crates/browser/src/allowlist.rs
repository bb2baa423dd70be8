//! Catalogue of permitted instruction shapes.
//!
//! A command must match one of these patterns before it reaches the parser.
//! Every pattern is anchored at both ends.

use once_cell::sync::Lazy;
use regex::Regex;

const STR: &str = r#"(?:'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*")"#;
const HTTP_URL: &str = r#"(?:'https?://(?:[^'\\]|\\.)*'|"https?://(?:[^"\\]|\\.)*")"#;
const LOAD_STATE: &str = r#"(?:'(?:load|domcontentloaded|networkidle)'|"(?:load|domcontentloaded|networkidle)")"#;
const LOCATOR_CALLS: &str =
    "(?:locator|get_by_text|get_by_role|get_by_placeholder|get_by_label|get_by_test_id|get_by_alt_text|get_by_title)";
const NO_ARG_ACTIONS: &str =
    "(?:click|dblclick|check|uncheck|hover|focus|wait_for|is_visible|text_content|inner_text|input_value)";

static ALLOWED_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    let value = format!(r"(?:{STR}|-?\d+(?:\.\d+)?|True|False|true|false|None|null)");
    let list = format!(r"\[\s*(?:{STR}\s*,?\s*)*\]");
    let kw = format!(r"\w+\s*=\s*(?:{value}|{list})");
    let opts = format!(r"\{{\s*(?:\w+\s*:\s*{value}\s*,?\s*)*\}}");
    let option = format!("(?:{kw}|{opts})");
    let options = format!(r"(?:{option}(?:\s*,\s*{option})*\s*,?)?");
    let trail = format!(r"(?:\s*,\s*{option})*\s*,?\s*");

    let segment = format!(
        r"(?:\.{LOCATOR_CALLS}\(\s*{STR}{trail}\)|\.filter\(\s*{options}\s*\)|\.first(?:\(\s*\))?|\.last(?:\(\s*\))?|\.nth\(\s*-?\d+\s*\))"
    );
    let chain = format!(r"{LOCATOR_CALLS}\(\s*{STR}{trail}\){segment}*");
    let action = format!(
        r"\.(?:{NO_ARG_ACTIONS}\(\s*{options}\s*\)|(?:fill|type|press)\(\s*{STR}{trail}\)|select_option\(\s*(?:{STR}|{list}){trail}\))"
    );

    let patterns = vec![
        // Navigation
        format!(r"^goto\(\s*{HTTP_URL}{trail}\)$"),
        r"^url(?:\(\s*\))?$".to_string(),
        format!(r"^wait_for_load_state\(\s*(?:{LOAD_STATE}{trail}|{options})\s*\)$"),
        // Page-level shortcuts
        format!(r"^(?:{NO_ARG_ACTIONS}|wait_for_selector)\(\s*{STR}{trail}\)$"),
        format!(r"^(?:fill|type|press)\(\s*{STR}\s*,\s*{STR}{trail}\)$"),
        format!(r"^select_option\(\s*{STR}\s*,\s*(?:{STR}|{list}){trail}\)$"),
        // Keyboard
        format!(r"^keyboard\.(?:press|type)\(\s*{STR}\s*\)$"),
        // Locator chains
        format!(r"^{chain}{action}$"),
        // Assertions
        format!(
            r"^expect\(\s*{chain}\s*\)\.(?:to_be_visible\(\s*{options}\s*\)|(?:to_have_text|to_contain_text|to_have_value)\(\s*{STR}{trail}\))$"
        ),
    ];

    patterns
        .iter()
        .map(|p| Regex::new(p).expect("allow-list pattern is valid"))
        .collect()
});

/// Drops every `await ` and `page.` and a trailing `;`.
pub fn clean(instruction: &str) -> String {
    instruction
        .replace("await ", "")
        .replace("page.", "")
        .trim()
        .trim_end_matches(';')
        .trim()
        .to_string()
}

pub fn is_allowed(instruction: &str) -> bool {
    let cleaned = clean(instruction);
    ALLOWED_PATTERNS.iter().any(|p| p.is_match(&cleaned))
}
