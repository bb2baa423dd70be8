use std::path::PathBuf;
use stepwise_browser::{allowlist, command};
use stepwise_core::Paths;

pub async fn run(explicit: Option<PathBuf>, input: &str) -> anyhow::Result<()> {
    let config = super::load_config(&Paths::new(), explicit.as_deref())?;
    let allowed = allowlist::is_allowed(input);

    println!("Command:    {}", allowlist::clean(input));
    println!("Allow-list: {}", if allowed { "match" } else { "no match" });
    if !config.browser.enforce_allow_list {
        println!("            (not enforced: browser.enforceAllowList is false)");
    }

    match command::parse(input) {
        Ok(parsed) => {
            println!("Kind:       {}", parsed.name());
            println!("Mutating:   {}", parsed.is_mutating());
            println!("Parsed:     {:?}", parsed);
        }
        Err(e) => println!("Parse:      {}", e),
    }

    if config.browser.enforce_allow_list && !allowed {
        anyhow::bail!("command would be rejected");
    }
    command::parse(input)?;
    Ok(())
}
