//! Built-in Tools
//!
//! Small tools that are useful for demos and smoke tests against real models.

use chrono::Utc;
use serde::Deserialize;

use crate::error::{AgentError, Result};
use crate::schema::{ObjectSchema, ParameterSchema};
use crate::tool::{FunctionTool, Tool, ToolContext};

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Deserialize)]
struct CalculatorArgs {
    operation: Operation,
    a: f64,
    b: f64,
}

/// Arithmetic on two numbers
pub fn calculator_tool() -> impl Tool {
    let schema = ObjectSchema::new(vec![
        ParameterSchema::string("operation", "The arithmetic operation to perform")
            .one_of(["add", "subtract", "multiply", "divide"]),
        ParameterSchema::number("a", "First operand"),
        ParameterSchema::number("b", "Second operand"),
    ])
    .compile();

    FunctionTool::new(
        "calculator",
        "Perform basic arithmetic on two numbers",
        schema,
        |_ctx: ToolContext, args: CalculatorArgs| async move { calculate(&args) },
    )
}

fn calculate(args: &CalculatorArgs) -> Result<String> {
    let value = match args.operation {
        Operation::Add => args.a + args.b,
        Operation::Subtract => args.a - args.b,
        Operation::Multiply => args.a * args.b,
        Operation::Divide => {
            if args.b == 0.0 {
                return Err(AgentError::ToolExecution("division by zero".into()));
            }
            args.a / args.b
        }
    };
    Ok(format_number(value))
}

/// Integers print without a trailing `.0`
#[allow(clippy::cast_possible_truncation)]
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TimeFormat {
    #[default]
    Iso,
    Human,
    Unix,
}

#[derive(Debug, Deserialize)]
struct DateTimeArgs {
    #[serde(default)]
    format: TimeFormat,
}

/// Current UTC date and time
pub fn datetime_tool() -> impl Tool {
    let schema = ObjectSchema::new(vec![
        ParameterSchema::string("format", "Output format, defaults to iso")
            .one_of(["iso", "human", "unix"])
            .optional(),
    ])
    .compile();

    FunctionTool::new(
        "datetime",
        "Get the current date and time in UTC",
        schema,
        |_ctx: ToolContext, args: DateTimeArgs| async move {
            let now = Utc::now();
            Ok(match args.format {
                TimeFormat::Iso => now.to_rfc3339(),
                TimeFormat::Human => now.format("%A, %B %-d, %Y %H:%M:%S UTC").to_string(),
                TimeFormat::Unix => now.timestamp().to_string(),
            })
        },
    )
}
