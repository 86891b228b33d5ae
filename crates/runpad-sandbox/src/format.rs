//! Display formatting for values produced by sandboxed code.
//!
//! Values cross the isolate boundary as [`RuntimeValue`] snapshots. Composite
//! values carry their finished `JSON.stringify(value, null, 2)` text, taken
//! inside the isolate so numbers and nesting print exactly as the script sees
//! them. A snapshot that could not be taken (circular reference, BigInt
//! member) is `None` and formats as a fallback tag instead of failing.

use std::fmt;

/// A snapshot of a script value, detached from the isolate that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    /// `null`.
    Null,
    /// `undefined`.
    Undefined,
    /// A string primitive.
    String(String),
    /// A number primitive, including `NaN` and the infinities.
    Number(f64),
    /// A boolean primitive.
    Boolean(bool),
    /// A callable. `None` or an empty name renders as `anonymous`.
    Function {
        /// The function's `name` property.
        name: Option<String>,
    },
    /// An array, with its pretty-printed JSON text if it could be taken.
    Array(Option<String>),
    /// A non-array object, with its pretty-printed JSON text if it could be taken.
    Object(Option<String>),
    /// Anything else (symbols, bigints), already converted to text.
    Other(String),
}

/// A value raised by a `throw` inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrownValue {
    /// An `Error` instance.
    Error {
        /// The error's `name`, e.g. `TypeError`.
        name: String,
        /// The error's `message`.
        message: String,
    },
    /// Any other thrown value, as its string conversion.
    Value(String),
}

impl fmt::Display for ThrownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error { name, message } => write!(f, "{name}: {message}"),
            Self::Value(text) => f.write_str(text),
        }
    }
}

/// Turn a runtime value into display text. Never fails.
pub fn format(value: &RuntimeValue) -> String {
    match value {
        RuntimeValue::Null => "null".to_string(),
        RuntimeValue::Undefined => "undefined".to_string(),
        RuntimeValue::String(s) => s.clone(),
        RuntimeValue::Number(n) => format_number(*n),
        RuntimeValue::Boolean(b) => b.to_string(),
        RuntimeValue::Function { name } => {
            let name = name.as_deref().filter(|n| !n.is_empty()).unwrap_or("anonymous");
            format!("[Function: {name}]")
        }
        RuntimeValue::Array(text) => text.clone().unwrap_or_else(|| "[Array]".to_string()),
        RuntimeValue::Object(text) => text.clone().unwrap_or_else(|| "[Object]".to_string()),
        RuntimeValue::Other(text) => text.clone(),
    }
}

/// Format every argument of a console call and join them with single spaces.
pub fn format_args(values: &[RuntimeValue]) -> String {
    values.iter().map(format).collect::<Vec<_>>().join(" ")
}

/// Render a number the way the scripting language's `String(n)` does.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        // Covers -0 as well.
        return "0".to_string();
    }
    if n < 0.0 {
        return format!("-{}", format_number(-n));
    }

    // Shortest round-trip digits, e.g. "1.2345e3".
    let sci = format!("{n:e}");
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    let n_exp = exponent.parse::<i32>().unwrap_or(0) + 1;

    if k <= n_exp && n_exp <= 21 {
        let mut out = digits;
        out.extend(std::iter::repeat('0').take((n_exp - k) as usize));
        out
    } else if 0 < n_exp && n_exp <= 21 {
        let (int, frac) = digits.split_at(n_exp as usize);
        format!("{int}.{frac}")
    } else if -6 < n_exp && n_exp <= 0 {
        format!("0.{}{}", "0".repeat((-n_exp) as usize), digits)
    } else {
        let e = n_exp - 1;
        let sign = if e < 0 { '-' } else { '+' };
        let (first, rest) = digits.split_at(1);
        if rest.is_empty() {
            format!("{first}e{sign}{}", e.abs())
        } else {
            format!("{first}.{rest}e{sign}{}", e.abs())
        }
    }
}
