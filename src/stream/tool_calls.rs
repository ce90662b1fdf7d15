use crate::types::{Function, Tool};

/// Reassembles streamed tool-call fragments into whole calls.
///
/// OpenAI deltas address a call by `index`; a delta without one extends the
/// most recent call. Anthropic streams open a call with `start` and feed its
/// arguments through `append_to_last`.
#[derive(Debug, Default, Clone)]
pub struct ToolCallAssembler {
    calls: Vec<Tool>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new call at `index = len(calls)` and returns that index.
    pub fn start(&mut self, id: impl Into<String>, name: impl Into<String>) -> usize {
        let index = self.calls.len();
        self.calls.push(Tool {
            id: Some(id.into()),
            tool_type: "function".to_string(),
            function: Function {
                name: name.into(),
                arguments: Some(String::new()),
                ..Default::default()
            },
            index: Some(index),
        });
        index
    }

    /// Appends an argument fragment to the most recent call.
    pub fn append_to_last(&mut self, fragment: &str) -> Option<usize> {
        let last = self.calls.last_mut()?;
        last.function
            .arguments
            .get_or_insert_with(String::new)
            .push_str(fragment);
        last.index
    }

    /// Merges one OpenAI-style delta. Returns the index of the call it touched.
    pub fn push_delta(&mut self, delta: &Tool) -> usize {
        let pos = match delta.index {
            Some(i) => match self.calls.iter().position(|c| c.index == Some(i)) {
                Some(pos) => pos,
                None => {
                    self.calls.push(Tool {
                        id: None,
                        tool_type: "function".to_string(),
                        function: Function::default(),
                        index: Some(i),
                    });
                    self.calls.len() - 1
                }
            },
            None if !self.calls.is_empty() => self.calls.len() - 1,
            None => {
                self.calls.push(Tool {
                    id: None,
                    tool_type: "function".to_string(),
                    function: Function::default(),
                    index: Some(0),
                });
                0
            }
        };

        let call = &mut self.calls[pos];
        if let Some(id) = delta.id.as_deref().filter(|s| !s.is_empty()) {
            if call.id.is_none() {
                call.id = Some(id.to_string());
            }
        }
        if !delta.function.name.is_empty() && call.function.name.is_empty() {
            call.function.name = delta.function.name.clone();
        }
        if let Some(fragment) = &delta.function.arguments {
            call.function
                .arguments
                .get_or_insert_with(String::new)
                .push_str(fragment);
        }
        call.index.unwrap_or(pos)
    }

    /// Replaces empty arguments of the last call with `{}`. Returns its index
    /// when a replacement happened.
    pub fn fill_empty_last_arguments(&mut self) -> Option<usize> {
        let last = self.calls.last_mut()?;
        if last.arguments().trim().is_empty() {
            last.function.arguments = Some("{}".to_string());
            return last.index;
        }
        None
    }

    pub fn calls(&self) -> &[Tool] {
        &self.calls
    }

    pub fn last(&self) -> Option<&Tool> {
        self.calls.last()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Whole calls in the non-streaming shape (no `index`).
    pub fn finalize(self) -> Vec<Tool> {
        self.calls
            .into_iter()
            .map(|mut c| {
                c.index = None;
                c
            })
            .collect()
    }
}
