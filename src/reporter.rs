use super::token::{Token, TokenType};
use colored::Colorize;
use std::fmt;

#[derive(Debug, Clone, Copy)]
pub enum Phase {
    Lexical,
    Compilation,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub phase: Phase,
    pub msg: String,
    pub token: Token,
}

impl Report {
    pub fn new(phase: Phase, msg: String, token: Token) -> Self {
        Report { phase, msg, token }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (line, _) = self.token.pos();
        match self.token.typ {
            TokenType::EOF => write!(f, "[line {}] Error at end: {}", line, self.msg),
            TokenType::UnTermedString | TokenType::InvalidNumber | TokenType::Unknown => {
                write!(f, "[line {}] Error: {}", line, self.msg)
            }
            _ => write!(
                f,
                "[line {}] Error at '{}': {}",
                line, self.token.lexeme, self.msg
            ),
        }
    }
}

pub trait Reporter {
    fn warning(&mut self, report: Report);
    fn error(&mut self, report: Report);
}

pub struct CliReporter;

impl CliReporter {
    pub fn new() -> Self {
        CliReporter
    }
}

impl Reporter for CliReporter {
    fn warning(&mut self, report: Report) {
        eprintln!("{}", report.to_string().bright_yellow());
    }

    fn error(&mut self, report: Report) {
        eprintln!("{}", report.to_string().bright_red());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenType;
    use std::rc::Rc;

    #[test]
    fn report_names_the_offending_lexeme() {
        let source = Rc::new("var 1;".to_string());
        let token = Token::new(TokenType::Number, Rc::clone(&source), "1".to_string(), 4);
        let report = Report::new(Phase::Compilation, "Expect variable name.".to_string(), token);
        assert_eq!(
            report.to_string(),
            "[line 1] Error at '1': Expect variable name."
        );
    }
}
