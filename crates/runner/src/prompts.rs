//! Prompt templates for the LLM-backed translator and generator.

pub const TRANSLATOR_SYSTEM: &str = "You convert plain-English browser test instructions into Gherkin steps. \
Reply with JSON only, no prose and no code fences.";

pub const TRANSLATOR_TEMPLATE: &str = r#"Convert the test description below into an ordered list of Gherkin steps.

Return a JSON array. Each element is an object with these keys:
- "gherkin": the full Gherkin sentence (Given/When/Then/And ...)
- "action": one of "navigate", "click", "input", "verify", "wait"
- "target": the page element or page the step acts on, described in words
- "value": the text to type, only for "input" steps

Keep one step per instruction line, in the same order. Do not add steps that
the description does not ask for.

Example:
[
  {"gherkin": "When I enter \"ada@example.test\" into the email field", "action": "input", "target": "email field", "value": "ada@example.test"},
  {"gherkin": "And I click the \"Sign in\" button", "action": "click", "target": "Sign in button"}
]

Test description:
{natural_language_description}"#;

pub const GENERATOR_SYSTEM: &str = "You write Playwright (Python sync API syntax) commands for a test runner. \
Reply with JSON only, no prose and no code fences.";

pub const GENERATOR_TEMPLATE: &str = r#"Given the semantic snapshot of the current page and one Gherkin step,
write the commands that perform the step.

Return a JSON object with two arrays of strings:
- "high_precision": commands that target the element by role and accessible name, label, placeholder or test id
- "low_precision": fallbacks using text or CSS selectors

Order each list from most to least likely to work. Each command is a single
call on `page` or an `expect(...)` assertion, for example:
  page.get_by_role('button', name='Sign in').click()
  page.get_by_label('Email').fill('ada@example.test')
  page.get_by_placeholder('Search').press('Enter')
  page.locator('#terms').check()
  page.locator('select#size').select_option('M')
  page.keyboard.press('Enter')
  page.wait_for_load_state('networkidle')
  expect(page.get_by_text('Welcome back')).to_be_visible()
  expect(page.locator('h1')).to_have_text('Dashboard')

Only use these shapes: goto, click, dblclick, fill, type, press, check,
uncheck, select_option, hover, focus, wait_for, wait_for_selector,
wait_for_load_state, keyboard.press, keyboard.type, and the expect
assertions to_be_visible, to_have_text, to_contain_text, to_have_value.
Never use evaluate or any other call.

Page snapshot:
{html_snapshot}

Gherkin step:
{gherkin_step}"#;

/// Substitutes `{name}` placeholders in one pass, so inserted values are
/// never scanned for further placeholders. Unknown braces are kept.
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let hit = values.iter().find_map(|(name, value)| {
            let key_len = name.len() + 2;
            let matches = tail.len() >= key_len
                && tail.as_bytes()[key_len - 1] == b'}'
                && tail.get(1..key_len - 1) == Some(*name);
            matches.then_some((key_len, *value))
        });
        match hit {
            Some((len, value)) => {
                out.push_str(value);
                rest = &tail[len..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn translator_prompt(natural_language: &str) -> String {
    fill(TRANSLATOR_TEMPLATE, &[("natural_language_description", natural_language.trim())])
}

pub fn generator_prompt(snapshot_json: &str, step_text: &str) -> String {
    fill(GENERATOR_TEMPLATE, &[("html_snapshot", snapshot_json), ("gherkin_step", step_text)])
}
