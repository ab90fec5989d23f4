use std::io::{self, BufRead, StdinLock, Stdout, Write};

/// Source of the lines typed by the user.
pub trait LineReader {
    /// Shows `prompt`, or the reader's default prompt, and reads one line without its line
    /// terminator. `None` once the input is exhausted (Ctrl-D on an empty line).
    ///
    /// `hints` are completion candidates for readers able to offer them.
    fn read_line(&mut self, prompt: Option<&str>, hints: &[String]) -> io::Result<Option<String>>;
}

/// A [`LineReader`] printing its prompts to one stream and reading lines from another.
/// Completion hints are ignored.
pub struct PromptReader<R, W> {
    input: R,
    output: W,
    prompt: String,
}

impl<R: BufRead, W: Write> PromptReader<R, W> {
    pub fn new(input: R, output: W, prompt: impl Into<String>) -> Self {
        Self {
            input,
            output,
            prompt: prompt.into(),
        }
    }
}

impl PromptReader<StdinLock<'static>, Stdout> {
    pub fn stdin(prompt: impl Into<String>) -> Self {
        Self::new(io::stdin().lock(), io::stdout(), prompt)
    }
}

impl<R: BufRead, W: Write> LineReader for PromptReader<R, W> {
    fn read_line(&mut self, prompt: Option<&str>, _hints: &[String]) -> io::Result<Option<String>> {
        write!(self.output, "{}", prompt.unwrap_or(&self.prompt))?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        let len = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(len);
        Ok(Some(line))
    }
}

/// Replays a fixed list of lines, then reports the end of input.
#[cfg(test)]
pub struct ScriptedReader {
    lines: std::collections::VecDeque<String>,
    pub prompts: Vec<Option<String>>,
    pub hints: Vec<Vec<String>>,
}

#[cfg(test)]
impl ScriptedReader {
    pub fn new(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            prompts: Vec::new(),
            hints: Vec::new(),
        }
    }
}

#[cfg(test)]
impl LineReader for ScriptedReader {
    fn read_line(&mut self, prompt: Option<&str>, hints: &[String]) -> io::Result<Option<String>> {
        self.prompts.push(prompt.map(str::to_string));
        self.hints.push(hints.to_vec());
        Ok(self.lines.pop_front())
    }
}
