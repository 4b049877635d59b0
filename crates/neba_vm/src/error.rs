use std::fmt;

/// Errors raised while walking the AST into bytecode.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    UndefinedVariable(String),
    UnknownOperator(String),
    UnknownPrefixOperator(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::UndefinedVariable(n)     => write!(f, "undefined variable: {}", n),
            CompileError::UnknownOperator(op)       => write!(f, "unknown operator: {}", op),
            CompileError::UnknownPrefixOperator(op) => write!(f, "unknown prefix operator: {}", op),
        }
    }
}

impl std::error::Error for CompileError {}

/// Errors raised while running compiled bytecode.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    StackOverflow,
    CallingNonFunction,
    WrongNumberOfArguments { want: usize, got: usize },
    UnsupportedTypesForBinaryOperation { left: &'static str, right: &'static str },
    UnknownIntegerOperator(&'static str),
    UnknownStringOperator(&'static str),
    UnusableAsHashKey(&'static str),
    IndexOperatorNotSupported(&'static str),
    ArgumentNotSupported { builtin: &'static str, got: &'static str },
    DivisionByZero,
    NotAFunction,
    Compile(CompileError),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::StackOverflow => write!(f, "stack overflow"),
            VmError::CallingNonFunction => write!(f, "calling non-function and non-built-in"),
            VmError::WrongNumberOfArguments { want, got } =>
                write!(f, "wrong number of arguments: want={}, got={}", want, got),
            VmError::UnsupportedTypesForBinaryOperation { left, right } =>
                write!(f, "unsupported types for binary operation: {} {}", left, right),
            VmError::UnknownIntegerOperator(op) => write!(f, "unknown integer operator: {}", op),
            VmError::UnknownStringOperator(op)  => write!(f, "unknown string operator: {}", op),
            VmError::UnusableAsHashKey(t)       => write!(f, "unusable as hash key: {}", t),
            VmError::IndexOperatorNotSupported(t) => write!(f, "index operator not supported: {}", t),
            VmError::ArgumentNotSupported { builtin, got } =>
                write!(f, "argument to `{}` not supported, got {}", builtin, got),
            VmError::DivisionByZero => write!(f, "division by zero"),
            VmError::NotAFunction => write!(f, "not a function"),
            VmError::Compile(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for VmError {}

impl From<CompileError> for VmError {
    fn from(e: CompileError) -> Self {
        VmError::Compile(e)
    }
}

pub type CompileResult<T> = Result<T, CompileError>;
pub type VmResult<T = crate::value::Value> = Result<T, VmError>;
