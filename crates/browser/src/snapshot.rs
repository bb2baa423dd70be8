//! Semantic page snapshots.
//!
//! Reduces raw markup to a role/name/attribute tree in the spirit of an
//! accessibility tree. Every function here is a pure recursive walk over the
//! immutable `scraper` document; nothing is mutated in place.

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use stepwise_core::{Error, Result};
use tracing::debug;

/// Attributes copied into `SemanticNode::attributes`.
const VISIBLE_ATTRIBUTES: &[&str] = &[
    "id",
    "class",
    "href",
    "aria-label",
    "data-testid",
    "role",
    "type",
    "value",
    "alt",
    "title",
    "aria-expanded",
    "aria-checked",
    "aria-selected",
    "aria-disabled",
    "aria-pressed",
    "aria-haspopup",
    "tabindex",
    "style",
    "src",
    "aria-level",
    "name",
    "placeholder",
];

/// Tags that never produce a node and never contribute text.
const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "head", "meta", "link", "title"];

const INTERACTIVE_TAGS: &[&str] = &["a", "button", "input", "select", "textarea"];

const INTERACTIVE_ROLES: &[&str] = &[
    "button", "link", "textbox", "combobox", "menuitem", "tab", "checkbox", "radio", "switch", "searchbox",
    "option",
];

const MEDIA_TAGS: &[&str] = &["img", "svg", "canvas", "iframe"];

fn default_true() -> bool {
    true
}

fn is_true(v: &bool) -> bool {
    *v
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticNode {
    pub role: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub focused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haspopup: Option<String>,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub visible: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SemanticNode>,
}

impl SemanticNode {
    pub fn new(role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
            level: None,
            focused: false,
            haspopup: None,
            visible: true,
            children: Vec::new(),
        }
    }

    fn web_area(title: &str) -> Self {
        Self::new("WebArea", title)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Total number of nodes in this subtree, including `self`.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(|c| c.count()).sum::<usize>()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOptions {
    /// Keep invisible elements and tag them `visible: false`.
    pub include_hidden: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder {
    options: SnapshotOptions,
}

impl SnapshotBuilder {
    pub fn new(options: SnapshotOptions) -> Self {
        Self { options }
    }

    pub fn build(&self, markup: Option<&str>) -> Result<SemanticNode> {
        let markup = markup.ok_or_else(|| Error::Validation("markup cannot be absent".to_string()))?;

        let document = Html::parse_document(markup);
        let title = document_title(&document);

        if let Some(body) = find_body(&document) {
            return Ok(self.finish_root(self.element_to_node(body, false), &title));
        }

        debug!("No <body> in document parse, retrying as fragment");
        let fragment = Html::parse_fragment(markup);
        let root = fragment.root_element();
        if root.children().next().is_none() {
            return Ok(SemanticNode::web_area(&title));
        }
        Ok(self.finish_root(self.element_to_node(root, false), &title))
    }

    fn finish_root(&self, node: Option<SemanticNode>, title: &str) -> SemanticNode {
        match node {
            Some(mut root) => {
                root.role = "WebArea".to_string();
                root.name = title.to_string();
                root
            }
            None => SemanticNode::web_area(title),
        }
    }

    fn element_to_node(&self, el: ElementRef<'_>, ancestor_hidden: bool) -> Option<SemanticNode> {
        let tag = el.value().name();
        if SKIPPED_TAGS.contains(&tag) {
            return None;
        }

        let hidden_here = ancestor_hidden || has_hidden_marker(el);
        let visible = !hidden_here && visible_by_content(el);
        if !visible && !self.options.include_hidden {
            return None;
        }

        let role = tag_to_role(el)?;
        let text = full_text(el);
        let name = get_name(el, &role, &text);
        let attributes = collect_attributes(el);

        let mut node = SemanticNode::new(role.clone(), name);
        node.visible = visible;

        if role == "heading" {
            node.level = Some(heading_level(el));
        }
        node.focused = is_focused(el);
        node.haspopup = el
            .value()
            .attr("haspopup")
            .or_else(|| el.value().attr("aria-haspopup"))
            .map(|v| v.to_string());

        node.children = child_elements(el)
            .filter_map(|child| self.element_to_node(child, hidden_here))
            .collect();

        let has_aria_label = attr_ci(el, "aria-label").is_some();
        if !text.is_empty() && role == "text" && text != node.name && !has_aria_label {
            let mut collapsed = SemanticNode::new("text", text);
            collapsed.visible = visible;
            return Some(collapsed);
        }

        node.attributes = attributes;
        Some(node)
    }
}

/// Reduces `markup` with default options. `None` is a validation error.
pub fn summarize(markup: Option<&str>) -> Result<SemanticNode> {
    SnapshotBuilder::default().build(markup)
}

fn find_body(document: &Html) -> Option<ElementRef<'_>> {
    let selector = Selector::parse("body").ok()?;
    document.select(&selector).next()
}

fn document_title(document: &Html) -> String {
    let selector = match Selector::parse("title") {
        Ok(s) => s,
        Err(_) => return String::new(),
    };
    // <title> is raw text to the parser, so comments arrive verbatim.
    let raw: String = match document.select(&selector).next() {
        Some(t) => t.text().collect(),
        None => return String::new(),
    };
    strip_comments(&raw).split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_comments(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start + 4..].find("-->") {
            Some(end) => rest = &rest[start + 4 + end + 3..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn join_fragments<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn child_elements<'a>(el: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    el.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| !SKIPPED_TAGS.contains(&c.value().name()))
}

/// Case-insensitive attribute lookup.
fn attr_ci<'a>(el: ElementRef<'a>, name: &str) -> Option<&'a str> {
    el.value()
        .attrs()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

fn style_hides(style: &str) -> bool {
    style.split(';').any(|decl| {
        let mut parts = decl.splitn(2, ':');
        let prop = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let value = parts
            .next()
            .unwrap_or("")
            .trim()
            .trim_end_matches("!important")
            .trim()
            .to_ascii_lowercase();
        match prop.as_str() {
            "display" => value == "none",
            "visibility" => value == "hidden",
            "opacity" => value.parse::<f64>().map(|o| o == 0.0).unwrap_or(false),
            _ => false,
        }
    })
}

/// Inline style, `hidden`, or `aria-hidden="true"` on this element alone.
pub fn has_hidden_marker(el: ElementRef<'_>) -> bool {
    if let Some(style) = attr_ci(el, "style") {
        if style_hides(style) {
            return true;
        }
    }
    if attr_ci(el, "hidden").is_some() {
        return true;
    }
    matches!(attr_ci(el, "aria-hidden"), Some(v) if v.trim().eq_ignore_ascii_case("true"))
}

fn is_interactive(el: ElementRef<'_>) -> bool {
    INTERACTIVE_TAGS.contains(&el.value().name())
        || attr_ci(el, "role").map(|r| INTERACTIVE_ROLES.contains(&r.trim())).unwrap_or(false)
}

/// Visibility from the element's own signal, ignoring ancestors.
fn visible_by_content(el: ElementRef<'_>) -> bool {
    if has_hidden_marker(el) {
        return false;
    }
    let text = full_text(el);
    let has_children = child_elements(el).next().is_some();

    if is_interactive(el) {
        return !text.is_empty() || el.value().attrs().next().is_some() || has_children;
    }
    if MEDIA_TAGS.contains(&el.value().name()) {
        return true;
    }
    if text.is_empty() && !has_children {
        return false;
    }
    if child_elements(el).any(visible_by_content) {
        return true;
    }
    !text.is_empty()
}

/// True when neither the element nor any ancestor is hidden and the element
/// carries enough signal to be worth reporting.
pub fn is_visible(el: ElementRef<'_>) -> bool {
    let mut current = el.parent().and_then(ElementRef::wrap);
    while let Some(ancestor) = current {
        if has_hidden_marker(ancestor) {
            return false;
        }
        current = ancestor.parent().and_then(ElementRef::wrap);
    }
    visible_by_content(el)
}

fn input_type_to_role(input_type: &str) -> Option<&'static str> {
    match input_type {
        "hidden" => None,
        "search" => Some("searchbox"),
        "checkbox" => Some("checkbox"),
        "radio" => Some("radio"),
        "submit" | "button" | "reset" | "image" | "file" => Some("button"),
        "range" => Some("slider"),
        _ => Some("textbox"),
    }
}

/// Explicit `role` wins; `None` means the element is dropped.
pub fn tag_to_role(el: ElementRef<'_>) -> Option<String> {
    if let Some(role) = attr_ci(el, "role") {
        let role = role.trim();
        if !role.is_empty() {
            return Some(role.to_string());
        }
    }

    let tag = el.value().name().to_ascii_lowercase();
    if tag == "input" {
        let input_type = attr_ci(el, "type").unwrap_or("text").trim().to_ascii_lowercase();
        return input_type_to_role(&input_type).map(str::to_string);
    }

    let role = match tag.as_str() {
        "a" => "link",
        "button" => "button",
        "select" => "combobox",
        "textarea" => "textbox",
        "option" => "option",
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => "heading",
        "nav" => "navigation",
        "img" | "svg" | "canvas" => "img",
        "iframe" => "document",
        "p" | "label" => "text",
        "form" => "form",
        "ul" | "ol" => "list",
        "li" => "listitem",
        "table" => "table",
        "tr" => "row",
        "td" => "cell",
        "th" => "columnheader",
        "main" => "main",
        "header" => "banner",
        "footer" => "contentinfo",
        "aside" => "complementary",
        "section" => "region",
        "dialog" => "dialog",
        _ => "generic",
    };
    Some(role.to_string())
}

/// Trimmed text of every descendant text node, joined with single spaces.
/// Subtrees that carry their own hidden marker do not contribute.
pub fn full_text(el: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    collect_text(el, &mut parts);
    parts.join(" ")
}

fn collect_text(el: ElementRef<'_>, parts: &mut Vec<String>) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            let t = text.trim();
            if !t.is_empty() {
                parts.push(t.to_string());
            }
        } else if let Some(child_el) = ElementRef::wrap(child) {
            if SKIPPED_TAGS.contains(&child_el.value().name()) || has_hidden_marker(child_el) {
                continue;
            }
            collect_text(child_el, parts);
        }
    }
}

/// Direct text children, or the own text of a sole child element.
fn own_text(el: ElementRef<'_>) -> String {
    let direct = join_fragments(el.children().filter_map(|c| c.value().as_text().map(|t| &**t)));
    if !direct.is_empty() {
        return direct;
    }
    let mut children = child_elements(el);
    match (children.next(), children.next()) {
        (Some(only), None) => own_text(only),
        _ => String::new(),
    }
}

pub fn get_name(el: ElementRef<'_>, role: &str, text: &str) -> String {
    if let Some(label) = attr_ci(el, "aria-label") {
        let label = label.trim();
        if !label.is_empty() {
            return label.to_string();
        }
    }

    if role != "generic" {
        let own = own_text(el);
        if !own.is_empty() {
            return own;
        }
    }

    if role == "generic" && child_elements(el).next().is_none() && !text.is_empty() {
        return text.to_string();
    }

    let tag = el.value().name();
    match tag {
        "img" => attr_ci(el, "alt").map(|v| v.trim().to_string()).unwrap_or_default(),
        "input" | "textarea" | "select" => ["aria-label", "value", "placeholder", "name"]
            .iter()
            .filter_map(|a| attr_ci(el, a))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .unwrap_or("")
            .to_string(),
        "iframe" => attr_ci(el, "title").map(|v| v.trim().to_string()).unwrap_or_default(),
        _ => String::new(),
    }
}

fn collect_attributes(el: ElementRef<'_>) -> BTreeMap<String, String> {
    el.value()
        .attrs()
        .filter(|(k, _)| VISIBLE_ATTRIBUTES.contains(k))
        .map(|(k, v)| {
            let value = if k == "class" {
                v.split_whitespace().collect::<Vec<_>>().join(" ")
            } else {
                v.to_string()
            };
            (k.to_string(), value)
        })
        .collect()
}

fn heading_level(el: ElementRef<'_>) -> u32 {
    if let Some(level) = attr_ci(el, "aria-level") {
        return level.trim().parse().unwrap_or(1);
    }
    let tag = el.value().name();
    tag.strip_prefix('h')
        .and_then(|d| d.parse::<u32>().ok())
        .filter(|d| (1..=6).contains(d))
        .unwrap_or(1)
}

fn has_focus_marker(el: ElementRef<'_>) -> bool {
    attr_ci(el, "autofocus").is_some() || attr_ci(el, "focus").is_some()
}

fn is_focused(el: ElementRef<'_>) -> bool {
    if matches!(attr_ci(el, "focused"), Some(v) if v.trim() == "true") {
        return true;
    }
    if !matches!(el.value().name(), "input" | "textarea") || !has_focus_marker(el) {
        return false;
    }
    let parent = match el.parent().and_then(ElementRef::wrap) {
        Some(p) => p,
        None => return false,
    };
    parent
        .descendants()
        .skip(1)
        .filter_map(ElementRef::wrap)
        .find(|d| has_focus_marker(*d))
        .map(|first| first.id() == el.id())
        .unwrap_or(false)
}
