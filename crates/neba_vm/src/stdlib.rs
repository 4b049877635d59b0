use crate::error::{VmError, VmResult};
use crate::value::{NativeFn, Value};

/// Fixed, ordered table of built-ins. Index in this table is the operand
/// `GetBuiltin` loads, so compiler and VM must agree on it — both get it
/// from here rather than duplicating the list.
pub const BUILTINS: &[(&str, NativeFn)] = &[
    ("len", builtin_len),
    ("first", builtin_first),
    ("last", builtin_last),
    ("rest", builtin_rest),
    ("push", builtin_push),
    ("print", builtin_print),
];

fn wrong_args(want: usize, got: usize) -> VmError {
    VmError::WrongNumberOfArguments { want, got }
}

fn bad_arg(builtin: &'static str, got: &Value) -> VmError {
    VmError::ArgumentNotSupported { builtin, got: got.type_name() }
}

fn builtin_len(args: &[Value]) -> VmResult {
    if args.len() != 1 {
        return Err(wrong_args(1, args.len()));
    }
    match &args[0] {
        Value::Str(s) => Ok(Value::Int(s.as_bytes().len() as i64)),
        Value::Array(a) => Ok(Value::Int(a.len() as i64)),
        other => Err(bad_arg("len", other)),
    }
}

fn builtin_first(args: &[Value]) -> VmResult {
    if args.len() != 1 {
        return Err(wrong_args(1, args.len()));
    }
    match &args[0] {
        Value::Array(a) => Ok(a.first().cloned().unwrap_or(Value::Null)),
        other => Err(bad_arg("first", other)),
    }
}

fn builtin_last(args: &[Value]) -> VmResult {
    if args.len() != 1 {
        return Err(wrong_args(1, args.len()));
    }
    match &args[0] {
        Value::Array(a) => Ok(a.last().cloned().unwrap_or(Value::Null)),
        other => Err(bad_arg("last", other)),
    }
}

fn builtin_rest(args: &[Value]) -> VmResult {
    if args.len() != 1 {
        return Err(wrong_args(1, args.len()));
    }
    match &args[0] {
        Value::Array(a) => {
            if a.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(Value::array(a[1..].to_vec()))
            }
        }
        other => Err(bad_arg("rest", other)),
    }
}

/// Functional push: returns a new array with `value` appended, leaves the
/// argument untouched.
fn builtin_push(args: &[Value]) -> VmResult {
    if args.len() != 2 {
        return Err(wrong_args(2, args.len()));
    }
    match &args[0] {
        Value::Array(a) => {
            let mut next = (**a).clone();
            next.push(args[1].clone());
            Ok(Value::array(next))
        }
        other => Err(bad_arg("push", other)),
    }
}

fn builtin_print(args: &[Value]) -> VmResult {
    for arg in args {
        println!("{}", arg);
    }
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_string_counts_bytes() {
        assert_eq!(builtin_len(&[Value::str("hello")]), Ok(Value::Int(5)));
    }

    #[test]
    fn test_len_array() {
        assert_eq!(
            builtin_len(&[Value::array(vec![Value::Int(1), Value::Int(2)])]),
            Ok(Value::Int(2))
        );
    }

    #[test]
    fn test_first_last_empty_array_is_null() {
        let empty = Value::array(vec![]);
        assert_eq!(builtin_first(&[empty.clone()]), Ok(Value::Null));
        assert_eq!(builtin_last(&[empty]), Ok(Value::Null));
    }

    #[test]
    fn test_rest_empty_is_null() {
        assert_eq!(builtin_rest(&[Value::array(vec![])]), Ok(Value::Null));
    }

    #[test]
    fn test_rest_drops_first() {
        let arr = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(builtin_rest(&[arr]), Ok(Value::array(vec![Value::Int(2), Value::Int(3)])));
    }

    #[test]
    fn test_push_does_not_mutate_original() {
        let original = Value::array(vec![Value::Int(1)]);
        let pushed = builtin_push(&[original.clone(), Value::Int(2)]).unwrap();
        assert_eq!(original, Value::array(vec![Value::Int(1)]));
        assert_eq!(pushed, Value::array(vec![Value::Int(1), Value::Int(2)]));
    }
}
