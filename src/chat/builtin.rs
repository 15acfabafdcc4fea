//! Tools available to every conversation.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use super::tools::{Tool, ToolDefinition};
use crate::{Error, Result};

/// Reports the local time and date.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_current_time".to_string(),
            description: "Get the current local time and date".to_string(),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
        }
    }

    async fn execute(&self, _args: Value) -> Result<String> {
        Ok(chrono::Local::now().format("%H:%M:%S on %d/%m/%Y").to_string())
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CalculateArgs {
    /// The arithmetic expression to evaluate, e.g. `2+2` or `15*3`.
    #[serde(default)]
    expression: String,
}

/// Evaluates basic arithmetic over decimals, `+ - * /` and parentheses.
///
/// Commas are digit-group separators: `1,000` is one thousand.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn definition(&self) -> ToolDefinition {
        let parameters = serde_json::to_value(schemars::schema_for!(CalculateArgs))
            .unwrap_or_else(|_| json!({"type": "object"}));
        ToolDefinition {
            name: "calculate".to_string(),
            description: "Evaluate a simple arithmetic expression".to_string(),
            parameters,
        }
    }

    async fn execute(&self, args: Value) -> Result<String> {
        let args: CalculateArgs = serde_json::from_value(args)
            .map_err(|e| Error::Tool(format!("invalid arguments: {e}")))?;
        let expression = args.expression.trim();
        if expression.is_empty() {
            return Ok("Error: missing 'expression' parameter".to_string());
        }
        if !expression.chars().all(is_allowed) {
            return Ok(
                "Expression not allowed: only digits and basic operators are permitted".to_string(),
            );
        }
        Ok(match evaluate(expression) {
            Ok(value) => format!("{expression} = {}", format_number(value)),
            Err(e) => format!("Calculation error: {e}"),
        })
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_digit() || "+-*/()., ".contains(c)
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn evaluate(expression: &str) -> std::result::Result<f64, String> {
    let mut parser = Parser {
        chars: expression
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ',')
            .collect(),
        pos: 0,
    };
    let value = parser.expr()?;
    if parser.pos < parser.chars.len() {
        return Err(format!("unexpected '{}'", parser.chars[parser.pos]));
    }
    Ok(value)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn expr(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    #[allow(clippy::float_cmp)]
    fn term(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(op @ ('*' | '/')) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            if op == '*' {
                value *= rhs;
            } else if rhs == 0.0 {
                return Err("division by zero".to_string());
            } else {
                value /= rhs;
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> std::result::Result<f64, String> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                Ok(-self.factor()?)
            }
            Some('+') => {
                self.pos += 1;
                self.factor()
            }
            Some('(') => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek() != Some(')') {
                    return Err("missing ')'".to_string());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '.') {
                    self.pos += 1;
                }
                let literal: String = self.chars[start..self.pos].iter().collect();
                literal
                    .parse()
                    .map_err(|_| format!("invalid number '{literal}'"))
            }
            Some(c) => Err(format!("unexpected '{c}'")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn calc(expression: &str) -> String {
        CalculatorTool
            .execute(json!({ "expression": expression }))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn evaluates_with_precedence() {
        assert_eq!(calc("2+2").await, "2+2 = 4");
        assert_eq!(calc("15*3").await, "15*3 = 45");
        assert_eq!(calc("2 + 3 * (4 - 1)").await, "2 + 3 * (4 - 1) = 11");
        assert_eq!(calc("1/4").await, "1/4 = 0.25");
        assert_eq!(calc("-3 * -2").await, "-3 * -2 = 6");
    }

    #[tokio::test]
    async fn commas_group_digits() {
        assert_eq!(calc("1,000+1").await, "1,000+1 = 1001");
        assert_eq!(calc("2,500 * 2").await, "2,500 * 2 = 5000");
    }

    #[tokio::test]
    async fn rejects_other_characters() {
        assert!(calc("__import__('os')").await.starts_with("Expression not allowed"));
        assert!(calc("2^3").await.starts_with("Expression not allowed"));
    }

    #[tokio::test]
    async fn reports_calculation_errors() {
        assert_eq!(calc("1/0").await, "Calculation error: division by zero");
        assert_eq!(calc("(1+2").await, "Calculation error: missing ')'");
        assert!(calc("1..2").await.starts_with("Calculation error"));
        assert_eq!(
            CalculatorTool.execute(json!({})).await.unwrap(),
            "Error: missing 'expression' parameter"
        );
    }

    #[tokio::test]
    async fn clock_reports_time() {
        let now = ClockTool.execute(json!({})).await.unwrap();
        assert!(now.contains(" on "), "{now}");
    }
}
