use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use rust_embed::Embed;
use tracing::debug;

use planwise_core::error::{PlanwiseError, Result};

#[derive(Embed)]
#[folder = "prompts/"]
struct DefaultPrompts;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{([A-Z_]+)\}").expect("placeholder pattern is valid"))
}

/// System prompt templates, one markdown file per agent role.
///
/// Files in the override directory shadow the built-in templates by name.
#[derive(Debug, Clone, Default)]
pub struct PromptTemplates {
    override_dir: Option<PathBuf>,
}

impl PromptTemplates {
    pub fn new(override_dir: Option<PathBuf>) -> Self {
        Self { override_dir }
    }

    fn load(&self, name: &str) -> Result<String> {
        let file = format!("{name}.md");

        if let Some(ref dir) = self.override_dir {
            let path = dir.join(&file);
            if path.is_file() {
                debug!(path = %path.display(), "Using prompt override");
                return Ok(std::fs::read_to_string(path)?);
            }
        }

        DefaultPrompts::get(&file)
            .map(|f| String::from_utf8_lossy(&f.data).into_owned())
            .ok_or_else(|| PlanwiseError::PromptNotFound(name.to_string()))
    }

    /// Load template `name` and fill its `{KEY}` placeholders.
    ///
    /// `CURRENT_TIME` is always available. Unknown keys are left as written.
    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> Result<String> {
        let template = self.load(name)?;
        let now = chrono::Local::now()
            .format("%a %b %d %Y %H:%M:%S %z")
            .to_string();

        let rendered = placeholder().replace_all(&template, |caps: &Captures| {
            let key = &caps[1];
            if let Some((_, value)) = vars.iter().find(|(k, _)| *k == key) {
                Cow::Owned(value.to_string())
            } else if key == "CURRENT_TIME" {
                Cow::Owned(now.clone())
            } else {
                Cow::Owned(caps[0].to_string())
            }
        });

        Ok(rendered.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_templates_exist() {
        let prompts = PromptTemplates::default();
        for name in [
            "coordinator",
            "planner",
            "planner_revise",
            "supervisor",
            "coder",
            "reporter",
            "tracker",
            "validator",
            "toy_agent",
        ] {
            assert!(prompts.render(name, &[]).is_ok(), "missing template {name}");
        }
    }

    #[test]
    fn test_substitution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("greeting.md"),
            "Hello {NAME}, it is {CURRENT_TIME}. {UNKNOWN} stays. {lower} too.",
        )
        .unwrap();
        let prompts = PromptTemplates::new(Some(dir.path().to_path_buf()));

        let text = prompts.render("greeting", &[("NAME", "Ada")]).unwrap();
        assert!(text.starts_with("Hello Ada, it is "));
        assert!(!text.contains("{CURRENT_TIME}"));
        assert!(text.contains("{UNKNOWN} stays."));
        assert!(text.contains("{lower} too."));
    }

    #[test]
    fn test_override_shadows_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("planner.md"), "custom planner for {USER_REQUEST}").unwrap();
        let prompts = PromptTemplates::new(Some(dir.path().to_path_buf()));

        let text = prompts.render("planner", &[("USER_REQUEST", "sales")]).unwrap();
        assert_eq!(text, "custom planner for sales");

        // Anything not overridden falls through to the built-in set
        assert!(prompts.render("supervisor", &[]).is_ok());
    }

    #[test]
    fn test_missing_template() {
        let err = PromptTemplates::default().render("nope", &[]).unwrap_err();
        assert!(matches!(err, PlanwiseError::PromptNotFound(ref n) if n == "nope"));
    }

    #[test]
    fn test_planner_revise_placeholders() {
        let text = PromptTemplates::default()
            .render(
                "planner_revise",
                &[
                    ("USER_REQUEST", "analyse sales"),
                    ("PREVIOUS_PLAN", "1. load data"),
                    ("USER_FEEDBACK", "add a chart"),
                    ("REVISION_COUNT", "1"),
                    ("MAX_REVISIONS", "10"),
                ],
            )
            .unwrap();
        assert!(text.contains("add a chart"));
        assert!(text.contains("1. load data"));
        assert!(!text.contains("{USER_FEEDBACK}"));
    }
}
