use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Small string helpers used when reading settings and environment values.
pub struct StringUtil;

impl StringUtil {
    /// Deserialize a JSON string into a value of type `T`.
    pub fn convert_from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
        serde_json::from_str(json).context("Failed to parse JSON value")
    }

    /// Convert a string to a boolean.
    ///
    /// Valid true values: `"1"`, `"true"`, `"yes"` (case-insensitive).
    /// Valid false values: `"0"`, `"false"`, `"no"` (case-insensitive).
    /// Returns `None` for unrecognized values.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        }
    }

    /// Read an environment variable as a boolean, `None` if unset or unparseable.
    pub fn env_flag(name: &str) -> Option<bool> {
        std::env::var(name)
            .ok()
            .and_then(|v| Self::convert_to_bool(&v))
    }

    /// Split a command line into words. Whitespace separates words except
    /// inside single or double quotes; a backslash escapes the next character
    /// outside single quotes.
    pub fn split_command_line(input: &str) -> Result<Vec<String>> {
        let mut words = Vec::new();
        let mut current = String::new();
        let mut in_word = false;
        let mut quote: Option<char> = None;
        let mut chars = input.chars();

        while let Some(ch) = chars.next() {
            match (quote, ch) {
                (Some(q), c) if c == q => quote = None,
                (Some('"') | None, '\\') => {
                    let escaped = chars
                        .next()
                        .context("Command line ends with a dangling backslash")?;
                    current.push(escaped);
                    in_word = true;
                }
                (Some(_), c) => current.push(c),
                (None, '\'' | '"') => {
                    quote = Some(ch);
                    in_word = true;
                }
                (None, c) if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                (None, c) => {
                    current.push(c);
                    in_word = true;
                }
            }
        }

        anyhow::ensure!(quote.is_none(), "Unterminated quote in command line: {input}");
        if in_word {
            words.push(current);
        }
        Ok(words)
    }
}
