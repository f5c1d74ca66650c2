//! Interactive confirmation

use anyhow::Result;
use std::io::{self, BufRead, IsTerminal, Write};

/// Ask a yes/no question on the terminal
///
/// Returns false when stdin is not a terminal.
pub fn confirm(prompt: &str) -> Result<bool> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Ok(false);
    }

    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    read_answer(&mut stdin.lock())
}

fn read_answer(reader: &mut impl BufRead) -> Result<bool> {
    let mut input = String::new();
    reader.read_line(&mut input)?;

    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_answer() {
        assert!(read_answer(&mut "y\n".as_bytes()).unwrap());
        assert!(read_answer(&mut " YES \n".as_bytes()).unwrap());
        assert!(!read_answer(&mut "n\n".as_bytes()).unwrap());
        assert!(!read_answer(&mut "\n".as_bytes()).unwrap());
        assert!(!read_answer(&mut "".as_bytes()).unwrap());
    }
}
