use colored::Colorize;
use serde_json::Value;

pub fn error_label() -> String {
    "Error:".red().bold().to_string()
}

/// Format the pipeline output for the terminal. With `raw_json` the array
/// is printed on one line, suitable for piping.
pub fn format_output(output: &Value, raw_json: bool) -> String {
    if raw_json {
        return output.to_string();
    }
    match output {
        Value::Array(records) if records.is_empty() => "(no records)".dimmed().to_string(),
        Value::Array(records) => records.iter().map(pretty_json).collect::<Vec<_>>().join("\n"),
        other => pretty_json(other),
    }
}

fn pretty_json(value: &Value) -> String {
    let formatted = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    colorize_json(&formatted)
}

fn colorize_json(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() * 2);
    let mut in_key = false;
    let mut in_string = false;
    let mut expect_key = true;
    let mut escape = false;
    let mut token = String::new();

    for ch in json_str.chars() {
        if escape {
            token.push(ch);
            escape = false;
            continue;
        }
        if ch == '\\' && (in_key || in_string) {
            token.push(ch);
            escape = true;
            continue;
        }

        if ch == '"' {
            token.push('"');
            if in_key {
                result.push_str(&token.blue().bold().to_string());
                token.clear();
                in_key = false;
                expect_key = false;
            } else if in_string {
                result.push_str(&token.green().to_string());
                token.clear();
                in_string = false;
            } else if expect_key {
                in_key = true;
            } else {
                in_string = true;
            }
            continue;
        }
        if in_key || in_string {
            token.push(ch);
            continue;
        }

        match ch {
            ':' => {
                result.push_str(&":".dimmed().to_string());
                expect_key = false;
            }
            ',' | '{' => {
                flush_primitive(&mut result, &mut token);
                result.push(ch);
                expect_key = true;
            }
            '}' | ']' | '[' => {
                flush_primitive(&mut result, &mut token);
                result.push(ch);
                expect_key = false;
            }
            _ if ch.is_whitespace() => {
                flush_primitive(&mut result, &mut token);
                result.push(ch);
            }
            _ => token.push(ch),
        }
    }
    flush_primitive(&mut result, &mut token);
    result
}

fn flush_primitive(result: &mut String, token: &mut String) {
    if token.is_empty() {
        return;
    }
    let colored = match token.as_str() {
        "true" | "false" => token.yellow().to_string(),
        "null" => token.dimmed().to_string(),
        t if t.parse::<f64>().is_ok() => token.cyan().to_string(),
        _ => token.clone(),
    };
    result.push_str(&colored);
    token.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plain<T>(f: impl FnOnce() -> T) -> T {
        colored::control::set_override(false);
        f()
    }

    #[test]
    fn raw_output_is_compact() {
        let out = format_output(&json!([{"a": 1}]), true);
        assert_eq!(out, r#"[{"a":1}]"#);
    }

    #[test]
    fn pretty_output_keeps_text() {
        let out = plain(|| format_output(&json!([{"k": "v, \"q\"", "n": [1, null, true]}]), false));
        let reparsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(reparsed, json!({"k": "v, \"q\"", "n": [1, null, true]}));
    }

    #[test]
    fn empty_output() {
        let out = plain(|| format_output(&json!([]), false));
        assert_eq!(out, "(no records)");
    }
}
