//! Minimal path selection over XML documents.
//!
//! Supports absolute location paths made of element local names
//! (`/Envelope/Body/login/user`), a `*` wildcard step, and a leading `//` to
//! match the final steps anywhere in the document. Namespace prefixes in the
//! path are ignored. The selected value is the text content of the first
//! matching element.

use crate::error::{Result, TokenBridgeError};
use crate::xml;

use quick_xml::events::Event;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementPath {
    steps: Vec<String>,
    anywhere: bool,
}

impl ElementPath {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let (anywhere, rest) = if let Some(rest) = expression.strip_prefix("//") {
            (true, rest)
        } else if let Some(rest) = expression.strip_prefix('/') {
            (false, rest)
        } else {
            return Err(TokenBridgeError::InvalidConfig(format!(
                "path '{}' must start with '/' or '//'",
                expression
            )));
        };

        let steps: Vec<String> = rest
            .split('/')
            .map(|step| match step.split_once(':') {
                Some((_, local)) => local.to_string(),
                None => step.to_string(),
            })
            .collect();

        if steps.iter().any(|s| s.is_empty()) {
            return Err(TokenBridgeError::InvalidConfig(format!(
                "path '{}' has an empty step",
                expression
            )));
        }
        Ok(Self { steps, anywhere })
    }

    fn matches(&self, stack: &[String]) -> bool {
        let n = self.steps.len();
        if self.anywhere {
            if stack.len() < n {
                return false;
            }
            step_match(&self.steps, &stack[stack.len() - n..])
        } else {
            stack.len() == n && step_match(&self.steps, stack)
        }
    }

    /// Text content of the first element matching this path
    pub fn select_text(&self, document: &str) -> Result<Option<String>> {
        let mut reader = xml::reader(document);
        let mut stack: Vec<String> = Vec::new();
        let mut capture: Option<(usize, String)> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    stack.push(xml::local_name(&e));
                    if capture.is_none() && self.matches(&stack) {
                        capture = Some((stack.len(), String::new()));
                    }
                }
                Event::Empty(e) => {
                    stack.push(xml::local_name(&e));
                    if capture.is_none() && self.matches(&stack) {
                        return Ok(Some(String::new()));
                    }
                    stack.pop();
                }
                Event::Text(t) => {
                    if let Some((_, text)) = capture.as_mut() {
                        text.push_str(&t.unescape()?);
                    }
                }
                Event::CData(t) => {
                    if let Some((_, text)) = capture.as_mut() {
                        text.push_str(&String::from_utf8_lossy(&t));
                    }
                }
                Event::End(_) => {
                    if let Some((depth, text)) = capture.take() {
                        if depth == stack.len() {
                            return Ok(Some(text));
                        }
                        capture = Some((depth, text));
                    }
                    stack.pop();
                }
                Event::Eof => return Ok(None),
                _ => {}
            }
        }
    }
}

fn step_match(steps: &[String], names: &[String]) -> bool {
    steps
        .iter()
        .zip(names.iter())
        .all(|(step, name)| step == "*" || step == name)
}
