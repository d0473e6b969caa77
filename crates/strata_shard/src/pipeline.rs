//! Pipeline manifest parsing.
//!
//! Manifests are small line-oriented documents stored as ordinary files in
//! the pipelines repo:
//!
//! ```text
//! image ubuntu
//! input data
//! run cp -r /in/data /out
//! shuffle data
//! ```
//!
//! `image` is required exactly once; `input`, `run`, and `shuffle` keep
//! their declaration order; unknown directives are skipped with a warning.

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub image: String,
    pub inputs: Vec<String>,
    pub runs: Vec<String>,
    pub shuffles: Vec<String>,
}

impl Pipeline {
    pub fn parse(manifest: &str) -> anyhow::Result<Self> {
        let mut image: Option<String> = None;
        let mut inputs = Vec::new();
        let mut runs = Vec::new();
        let mut shuffles = Vec::new();

        for line in manifest.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (directive, arg) = match line.split_once(char::is_whitespace) {
                Some((directive, arg)) => (directive, arg.trim()),
                None => (line, ""),
            };
            match directive {
                "image" => {
                    anyhow::ensure!(!arg.is_empty(), "image directive needs an argument");
                    anyhow::ensure!(
                        image.is_none(),
                        "image declared more than once ({} then {arg})",
                        image.as_deref().unwrap_or_default()
                    );
                    image = Some(arg.to_string());
                }
                "input" => {
                    anyhow::ensure!(!arg.is_empty(), "input directive needs an argument");
                    inputs.push(arg.trim_matches('/').to_string());
                }
                "run" => {
                    anyhow::ensure!(!arg.is_empty(), "run directive needs a command");
                    runs.push(arg.to_string());
                }
                "shuffle" => {
                    anyhow::ensure!(!arg.is_empty(), "shuffle directive needs a directory");
                    shuffles.push(arg.trim_matches('/').to_string());
                }
                other => {
                    warn!(directive = other, "ignoring unknown pipeline directive");
                }
            }
        }

        let image = image.ok_or_else(|| anyhow::anyhow!("pipeline has no image directive"))?;
        anyhow::ensure!(!runs.is_empty(), "pipeline has no run directive");
        Ok(Self {
            image,
            inputs,
            runs,
            shuffles,
        })
    }
}
