// File: src/repl.rs
//
// Interactive REPL for Ember. Multi-line input continues while any of
// `{ ( [` or a string literal is unbalanced; `exit` quits and `clear`
// clears the screen. Expression results other than nil are printed in
// the print_value format.

use crate::value::Value;
use crate::vm::Vm;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new(vm: Vm) -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm, editor })
    }

    fn show_banner(&self) {
        println!(
            "{} {}",
            "Ember".bright_yellow().bold(),
            format!("v{} interactive shell", env!("CARGO_PKG_VERSION")).dimmed()
        );
        println!("{}", "Type 'exit' to quit, 'clear' to clear the screen.".dimmed());
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();
        loop {
            let prompt = if buffer.is_empty() { "> " } else { "... " };

            match self.editor.readline(prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() {
                        match line.trim() {
                            "exit" => break,
                            "clear" => {
                                print!("\x1B[2J\x1B[1;1H");
                                continue;
                            }
                            _ => {}
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if input_is_balanced(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{} {}", "error:".bright_red(), err);
                    break;
                }
            }
        }
        Ok(())
    }

    fn eval_input(&mut self, input: &str) {
        if input.trim().is_empty() {
            return;
        }
        match self.vm.eval(input) {
            Ok(Value::Nil) => {}
            Ok(value) => {
                println!("{}", self.vm.format_value(&value));
            }
            Err(err) => {
                eprintln!("{}", err);
            }
        }
    }
}

/// Continuation is required while any of `{ ( [` or a string literal is
/// unbalanced. Comments are ignored.
fn input_is_balanced(input: &str) -> bool {
    let mut braces = 0i32;
    let mut brackets = 0i32;
    let mut parens = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    let mut in_line_comment = false;

    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if in_line_comment {
            if c == '\n' {
                in_line_comment = false;
            }
            continue;
        }
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '#' if !in_string => in_line_comment = true,
            '/' if !in_string => {
                if chars.peek() == Some(&'/') {
                    in_line_comment = true;
                }
            }
            '{' if !in_string => braces += 1,
            '}' if !in_string => braces -= 1,
            '[' if !in_string => brackets += 1,
            ']' if !in_string => brackets -= 1,
            '(' if !in_string => parens += 1,
            ')' if !in_string => parens -= 1,
            _ => {}
        }
    }

    !in_string && braces <= 0 && brackets <= 0 && parens <= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_simple_input() {
        assert!(input_is_balanced("print(1)\n"));
        assert!(input_is_balanced("x = 1\n"));
    }

    #[test]
    fn test_unbalanced_requires_continuation() {
        assert!(!input_is_balanced("function f() {\n"));
        assert!(!input_is_balanced("arr = [1, 2,\n"));
        assert!(!input_is_balanced("print(\n"));
        assert!(!input_is_balanced("s = \"unterminated\n"));
    }

    #[test]
    fn test_closing_balances() {
        assert!(input_is_balanced("function f() {\nreturn 1\n}\n"));
        assert!(input_is_balanced("arr = [1,\n2]\n"));
    }

    #[test]
    fn test_comments_do_not_count() {
        assert!(input_is_balanced("x = 1 // not a { brace\n"));
        assert!(input_is_balanced("y = 2 # nor ( this\n"));
    }
}
