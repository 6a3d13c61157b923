//! 命令值校验与规整
//!
//! 注册表本身不检查 `options` / `min` / `max`，由各处理器调用这里的函数。

use serde_json::Value;

use crate::error::{DeviceError, DeviceResult};

/// 接受 bool、`"ON"/"OFF"`、`"true"/"false"`、`1/0`
pub fn coerce_switch(capability: &str, value: &Value) -> DeviceResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f == 0.0 => Ok(false),
            Some(f) if f == 1.0 => Ok(true),
            _ => Err(DeviceError::invalid(capability, format!("expected 0 or 1, got {}", n))),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" | "yes" => Ok(true),
            "off" | "false" | "0" | "no" => Ok(false),
            other => Err(DeviceError::invalid(capability, format!("expected ON/OFF, got '{}'", other))),
        },
        other => Err(DeviceError::invalid(capability, format!("expected boolean, got {}", other))),
    }
}

/// 解析数值，钳制到 `[min, max]` 并对齐到 `step`
pub fn coerce_number(capability: &str, value: &Value, min: f64, max: f64, step: f64) -> DeviceResult<f64> {
    let raw = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
    .ok_or_else(|| DeviceError::invalid(capability, format!("expected number, got {}", value)))?;

    let clamped = raw.clamp(min, max);
    let stepped = if step > 0.0 {
        (min + ((clamped - min) / step).round() * step).clamp(min, max)
    } else {
        clamped
    };
    Ok(stepped)
}

pub fn coerce_select(capability: &str, value: &Value, options: &[String]) -> DeviceResult<String> {
    let choice = match value {
        Value::String(s) => s.trim(),
        other => {
            return Err(DeviceError::invalid(capability, format!("expected string, got {}", other)));
        }
    };

    options
        .iter()
        .find(|option| option.eq_ignore_ascii_case(choice))
        .cloned()
        .ok_or_else(|| {
            DeviceError::invalid(
                capability,
                format!("'{}' is not one of [{}]", choice, options.join(", ")),
            )
        })
}

/// 整数步长时输出整数 JSON，避免持久化成 `15.0`
pub fn number_value(value: f64, step: f64) -> Value {
    if step.fract() == 0.0 && value.fract() == 0.0 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_switch_values() {
        assert!(coerce_switch("s", &json!(true)).unwrap());
        assert!(coerce_switch("s", &json!("ON")).unwrap());
        assert!(!coerce_switch("s", &json!("off")).unwrap());
        assert!(!coerce_switch("s", &json!(0)).unwrap());
        assert!(coerce_switch("s", &json!("maybe")).is_err());
        assert!(coerce_switch("s", &Value::Null).is_err());
    }

    #[test]
    fn test_number_clamps_and_steps() {
        assert_eq!(coerce_number("n", &json!(150), 0.0, 100.0, 5.0).unwrap(), 100.0);
        assert_eq!(coerce_number("n", &json!("-3"), 0.0, 100.0, 5.0).unwrap(), 0.0);
        assert_eq!(coerce_number("n", &json!(42), 0.0, 100.0, 5.0).unwrap(), 40.0);
        assert_eq!(coerce_number("n", &json!(7.3), 1.0, 10.0, 0.0).unwrap(), 7.3);
        assert!(coerce_number("n", &json!("abc"), 0.0, 1.0, 1.0).is_err());
    }

    #[test]
    fn test_select_is_case_insensitive() {
        let options = vec!["left".to_string(), "right".to_string()];
        assert_eq!(coerce_select("sel", &json!("Left"), &options).unwrap(), "left");

        let err = coerce_select("sel", &json!("up"), &options).unwrap_err();
        assert!(err.to_string().contains("not one of"));
    }

    #[test]
    fn test_number_value_integer_output() {
        assert_eq!(number_value(15.0, 1.0), json!(15));
        assert_eq!(number_value(0.5, 0.5), json!(0.5));
    }
}
