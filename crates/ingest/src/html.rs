use std::sync::LazyLock;

use core_model::{ImportError, Result, validate_identifier};
use regex::Regex;
use serde_json::Value;

pub const DEFAULT_VARIABLE: &str = "jsonData";

pub const EXCERPT_CHARS: usize = 200;

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script[^>]*>(.*?)</script>").unwrap());

pub struct ScriptData {
    assignment: Regex,
    variable: String,
}

impl ScriptData {
    pub fn new(variable: &str) -> Result<Self> {
        let variable = validate_identifier(variable)?;
        let assignment = Regex::new(&format!(r"\b{}\s*=\s*\[", regex::escape(variable)))
            .map_err(|_| ImportError::InvalidIdentifier(variable.to_string()))?;
        Ok(Self {
            assignment,
            variable: variable.to_string(),
        })
    }

    /// Decodes the array assigned in the first script block that carries the
    /// assignment. Whatever follows the array literal is ignored.
    pub fn extract(&self, origin: &str, html: &str) -> Result<Value> {
        let found = SCRIPT_BLOCK
            .captures_iter(html)
            .filter_map(|c| c.get(1))
            .find_map(|block| {
                self.assignment
                    .find(block.as_str())
                    .map(|m| &block.as_str()[m.end() - 1..])
            });
        let Some(literal) = found else {
            return Err(ImportError::malformed(
                origin,
                format!("no <script> block assigns {}", self.variable),
            ));
        };

        let mut stream = serde_json::Deserializer::from_str(literal).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(ImportError::MalformedInput {
                origin: origin.to_string(),
                reason: format!("embedded {} does not decode: {err}", self.variable),
                excerpt: Some(excerpt(literal)),
            }),
            None => Err(ImportError::malformed(origin, "embedded data block is empty")),
        }
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_CHARS).collect()
}
