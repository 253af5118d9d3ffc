use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{self, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  Step(u32), // Step N times
  Quit,
  Continue,
}

/// Parse one line of step-mode input; empty input steps once
pub fn parse_command(line: &str) -> std::result::Result<Command, String> {
  let trimmed = line.trim();
  if trimmed.is_empty() {
    return Ok(Command::Step(1));
  }
  if let Some(num_str) = trimmed.strip_prefix("si") {
    let num_str = num_str.trim();
    if num_str.is_empty() {
      return Err("'si' requires a number, e.g., 'si 100'".to_string());
    }
    return match num_str.parse::<u32>() {
      Ok(n) if n > 0 => Ok(Command::Step(n)),
      Ok(_) => Err("step count must be greater than 0".to_string()),
      Err(e) => Err(format!("invalid number '{}': {}", num_str, e)),
    };
  }
  match trimmed {
    "q" => Ok(Command::Quit),
    "c" => Ok(Command::Continue),
    other => Err(format!(
      "Unknown command: '{}'. Use Enter to step, 'q' to quit, 'c' to continue, or 'si 100' to step N times",
      other
    )),
  }
}

pub struct Shell {
  editor: DefaultEditor,
}

impl Shell {
  pub fn new() -> Result<Self> {
    let editor = DefaultEditor::new().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(Self { editor })
  }

  pub fn read_command(&mut self) -> Result<Command> {
    loop {
      match self.editor.readline("(edgenpu) ") {
        Ok(line) => {
          let trimmed = line.trim();
          if !trimmed.is_empty() {
            let _ = self.editor.add_history_entry(trimmed);
          }
          match parse_command(trimmed) {
            Ok(cmd) => return Ok(cmd),
            Err(msg) => eprintln!("Error: {}", msg),
          }
        },
        // Ctrl-C / Ctrl-D
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(Command::Quit),
        Err(err) => return Err(io::Error::new(io::ErrorKind::Other, err)),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_command() {
    assert_eq!(parse_command(""), Ok(Command::Step(1)));
    assert_eq!(parse_command("si 100"), Ok(Command::Step(100)));
    assert_eq!(parse_command("  c "), Ok(Command::Continue));
    assert_eq!(parse_command("q"), Ok(Command::Quit));
    assert!(parse_command("si").is_err());
    assert!(parse_command("si 0").is_err());
    assert!(parse_command("si x").is_err());
    assert!(parse_command("run").is_err());
  }
}
