// File: src/natives/json.rs
//
// JSON natives built on serde_json, with the parser input caps enforced
// during conversion: 1 MiB input, 64 KiB strings, 10 000 array elements,
// 1 000 object keys, nesting depth 100. Strict policy: malformed input
// and cap violations raise typed errors; `json_validate` reports them
// as false instead.

use super::NativeDef;
use crate::errors::EmberError;
use crate::heap::HeapObject;
use crate::value::{format_number, Value};
use crate::vm::Vm;

const MAX_INPUT_BYTES: usize = 1024 * 1024;
const MAX_STRING_BYTES: usize = 64 * 1024;
const MAX_ARRAY_ELEMENTS: usize = 10_000;
const MAX_OBJECT_KEYS: usize = 1_000;
const MAX_DEPTH: usize = 100;

pub fn install(defs: &mut Vec<NativeDef>) {
    defs.push(NativeDef::new("json_parse", 1, json_parse));
    defs.push(NativeDef::new("json_stringify", 1, json_stringify));
    defs.push(NativeDef::new("json_validate", 1, json_validate));
}

fn input_arg(vm: &Vm, args: &[Value], native: &str) -> Result<String, EmberError> {
    match args {
        [Value::Str(h)] => Ok(vm.heap.get_str(*h).to_string()),
        _ => Err(EmberError::type_error(format!("{} requires a string argument", native))),
    }
}

fn json_parse(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    let input = input_arg(vm, args, "json_parse")?;
    parse_checked(vm, &input)
}

fn json_validate(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    let input = input_arg(vm, args, "json_validate")?;
    Ok(Value::Bool(parse_checked(vm, &input).is_ok()))
}

fn parse_checked(vm: &mut Vm, input: &str) -> Result<Value, EmberError> {
    if input.len() > MAX_INPUT_BYTES {
        return Err(EmberError::runtime(format!(
            "JSON input exceeds {} byte limit",
            MAX_INPUT_BYTES
        )));
    }
    let parsed: serde_json::Value = serde_json::from_str(input)
        .map_err(|e| EmberError::runtime(format!("Invalid JSON: {}", e)))?;
    from_json(vm, &parsed, 0)
}

fn from_json(vm: &mut Vm, json: &serde_json::Value, depth: usize) -> Result<Value, EmberError> {
    if depth > MAX_DEPTH {
        return Err(EmberError::runtime("JSON nesting exceeds depth limit"));
    }
    match json {
        serde_json::Value::Null => Ok(Value::Nil),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => Ok(Value::Number(n.as_f64().unwrap_or(f64::NAN))),
        serde_json::Value::String(s) => {
            if s.len() > MAX_STRING_BYTES {
                return Err(EmberError::runtime(format!(
                    "JSON string exceeds {} byte limit",
                    MAX_STRING_BYTES
                )));
            }
            vm.make_string(s.clone())
        }
        serde_json::Value::Array(items) => {
            if items.len() > MAX_ARRAY_ELEMENTS {
                return Err(EmberError::runtime(format!(
                    "JSON array exceeds {} element limit",
                    MAX_ARRAY_ELEMENTS
                )));
            }
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(from_json(vm, item, depth + 1)?);
            }
            vm.make_array(values)
        }
        serde_json::Value::Object(entries) => {
            if entries.len() > MAX_OBJECT_KEYS {
                return Err(EmberError::runtime(format!(
                    "JSON object exceeds {} key limit",
                    MAX_OBJECT_KEYS
                )));
            }
            let map = vm.make_map()?;
            let Value::Map(handle) = map else { unreachable!() };
            for (key, value) in entries {
                if key.len() > MAX_STRING_BYTES {
                    return Err(EmberError::runtime(format!(
                        "JSON string exceeds {} byte limit",
                        MAX_STRING_BYTES
                    )));
                }
                let key_value = vm.make_string(key.clone())?;
                let converted = from_json(vm, value, depth + 1)?;
                vm.heap.map_insert(handle, key_value, converted);
            }
            Ok(map)
        }
    }
}

fn json_stringify(vm: &mut Vm, args: &[Value]) -> Result<Value, EmberError> {
    let value = match args {
        [value] => *value,
        _ => return Err(EmberError::type_error("json_stringify requires a value argument")),
    };
    let json = to_json(vm, &value, 0)?;
    let text = serde_json::to_string(&json)
        .map_err(|e| EmberError::runtime(format!("JSON encoding failed: {}", e)))?;
    vm.make_string(text)
}

fn to_json(vm: &Vm, value: &Value, depth: usize) -> Result<serde_json::Value, EmberError> {
    if depth > MAX_DEPTH {
        return Err(EmberError::runtime("JSON nesting exceeds depth limit"));
    }
    match value {
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        // Integral values encode without a fraction; non-finite numbers
        // have no JSON form and encode as null
        Value::Number(n) => {
            if n.fract() == 0.0 && n.is_finite() && n.abs() < 9.0e15 {
                Ok(serde_json::Value::Number(serde_json::Number::from(*n as i64)))
            } else {
                Ok(serde_json::Number::from_f64(*n)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null))
            }
        }
        Value::Str(h) => Ok(serde_json::Value::String(vm.heap.get_str(*h).to_string())),
        Value::Array(h) => {
            let items = vm.heap.get_array(*h);
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(to_json(vm, item, depth + 1)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        Value::Set(h) => match vm.heap.get(*h) {
            HeapObject::Set(set) => {
                let mut out = Vec::with_capacity(set.len());
                for item in set.items() {
                    out.push(to_json(vm, item, depth + 1)?);
                }
                Ok(serde_json::Value::Array(out))
            }
            _ => unreachable!("set handle resolves to a set"),
        },
        Value::Map(h) => match vm.heap.get(*h) {
            HeapObject::Map(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for entry in map.entries() {
                    let key = match &entry.key {
                        Value::Str(k) => vm.heap.get_str(*k).to_string(),
                        Value::Number(n) => format_number(*n),
                        Value::Bool(b) => b.to_string(),
                        Value::Nil => "nil".to_string(),
                        other => {
                            return Err(EmberError::type_error(format!(
                                "Cannot use {} as a JSON object key",
                                other.type_name()
                            )))
                        }
                    };
                    out.insert(key, to_json(vm, &entry.value, depth + 1)?);
                }
                Ok(serde_json::Value::Object(out))
            }
            _ => unreachable!("map handle resolves to a map"),
        },
        other => Err(EmberError::type_error(format!(
            "Cannot serialize {} to JSON",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_val(vm: &mut Vm, s: &str) -> Value {
        vm.make_string(s).unwrap()
    }

    #[test]
    fn test_parse_object() {
        let mut vm = Vm::new();
        let input = str_val(&mut vm, "{\"name\":\"ember\",\"n\":2,\"ok\":true,\"nothing\":null}");
        let result = json_parse(&mut vm, &[input]).unwrap();
        let Value::Map(h) = result else { panic!("expected map from json_parse") };
        assert_eq!(vm.heap.map_get_str(h, "n"), Some(Value::Number(2.0)));
        assert_eq!(vm.heap.map_get_str(h, "ok"), Some(Value::Bool(true)));
        assert_eq!(vm.heap.map_get_str(h, "nothing"), Some(Value::Nil));
    }

    #[test]
    fn test_parse_array_and_round_trip() {
        let mut vm = Vm::new();
        let input = str_val(&mut vm, "[1,\"two\",[3]]");
        let parsed = json_parse(&mut vm, &[input]).unwrap();
        let text = json_stringify(&mut vm, &[parsed]).unwrap();
        assert_eq!(vm.get_string(&text), Some("[1,\"two\",[3]]"));
        let n = json_stringify(&mut vm, &[Value::Number(1.5)]).unwrap();
        assert_eq!(vm.get_string(&n), Some("1.5"));
    }

    #[test]
    fn test_invalid_json_raises() {
        let mut vm = Vm::new();
        let input = str_val(&mut vm, "{broken");
        let err = json_parse(&mut vm, &[input]).unwrap_err();
        assert!(err.message.contains("Invalid JSON"));
    }

    #[test]
    fn test_validate_reports_bool() {
        let mut vm = Vm::new();
        let good = str_val(&mut vm, "[1,2,3]");
        assert_eq!(json_validate(&mut vm, &[good]).unwrap(), Value::Bool(true));
        let bad = str_val(&mut vm, "{]");
        assert_eq!(json_validate(&mut vm, &[bad]).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_input_size_cap() {
        let mut vm = Vm::new();
        let big = format!("\"{}\"", "x".repeat(MAX_INPUT_BYTES + 10));
        let input = vm.make_string(big).unwrap();
        let err = json_parse(&mut vm, &[input]).unwrap_err();
        assert!(err.message.contains("byte limit"));
    }

    #[test]
    fn test_string_length_cap() {
        let mut vm = Vm::new();
        let long = format!("\"{}\"", "y".repeat(MAX_STRING_BYTES + 1));
        let input = vm.make_string(long).unwrap();
        let err = json_parse(&mut vm, &[input]).unwrap_err();
        assert!(err.message.contains("string exceeds"));
    }

    #[test]
    fn test_stringify_map_with_primitive_keys() {
        let mut vm = Vm::new();
        let map = vm.make_map().unwrap();
        let Value::Map(h) = map else { unreachable!() };
        let key = vm.make_string("k").unwrap();
        vm.heap.map_insert(h, key, Value::Number(1.0));
        vm.heap.map_insert(h, Value::Number(2.0), Value::Bool(false));
        let text = json_stringify(&mut vm, &[map]).unwrap();
        let text = vm.get_string(&text).unwrap();
        assert!(text.contains("\"k\":1"));
        assert!(text.contains("\"2\":false"));
    }

    #[test]
    fn test_stringify_rejects_functions() {
        let mut vm = Vm::new();
        vm.eval("function f() { return 1 }").unwrap();
        let f = vm.global("f").unwrap();
        let err = json_stringify(&mut vm, &[f]).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Type);
    }

    #[test]
    fn test_non_finite_numbers_encode_as_null() {
        let mut vm = Vm::new();
        let text = json_stringify(&mut vm, &[Value::Number(f64::NAN)]).unwrap();
        assert_eq!(vm.get_string(&text), Some("null"));
    }
}
