//! Objects hosted by `objmux serve`.

use std::sync::{Arc, Mutex, PoisonError};

use objmux_remoting::{
    CallContext, InterfaceShape, MemberRef, Registrar, RemoteException, RemoteObject,
    RemotingServer, Result, Value,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(x) => x,
        }
    }
}

fn number(args: &[Value], index: usize) -> std::result::Result<Number, RemoteException> {
    match args.get(index) {
        Some(Value::Int(i)) => Ok(Number::Int(*i)),
        Some(Value::Float(x)) => Ok(Number::Float(*x)),
        Some(other) => Err(RemoteException::invalid_argument(format!(
            "argument {index} must be a number, got {}",
            other.type_name()
        ))),
        None => Err(RemoteException::invalid_argument(format!(
            "missing argument {index}"
        ))),
    }
}

/// Integer operands stay integral (division truncates); anything else is
/// computed in floating point.
fn arithmetic(op: &str, a: Number, b: Number) -> std::result::Result<Value, RemoteException> {
    if let (Number::Int(a), Number::Int(b)) = (a, b) {
        let result = match op {
            "add" => a.checked_add(b),
            "subtract" => a.checked_sub(b),
            "multiply" => a.checked_mul(b),
            "divide" if b == 0 => return Err(RemoteException::invalid_argument("division by zero")),
            "divide" => a.checked_div(b),
            _ => return Err(RemoteException::invocation(format!("unknown operation {op}"))),
        };
        return result
            .map(Value::Int)
            .ok_or_else(|| RemoteException::invalid_argument(format!("{op} overflows")));
    }

    let (a, b) = (a.as_f64(), b.as_f64());
    let result = match op {
        "add" => a + b,
        "subtract" => a - b,
        "multiply" => a * b,
        "divide" if b == 0.0 => return Err(RemoteException::invalid_argument("division by zero")),
        "divide" => a / b,
        _ => return Err(RemoteException::invocation(format!("unknown operation {op}"))),
    };
    Ok(Value::Float(result))
}

fn square(x: Number) -> std::result::Result<Value, RemoteException> {
    match x {
        Number::Int(i) => i
            .checked_mul(i)
            .map(Value::Int)
            .ok_or_else(|| RemoteException::invalid_argument("square overflows")),
        Number::Float(f) => Ok(Value::Float(f * f)),
    }
}

pub struct Calculator {
    name: String,
    memory: Mutex<Value>,
}

impl Calculator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            memory: Mutex::new(Value::Null),
        }
    }
}

impl RemoteObject for Calculator {
    fn interfaces(&self) -> Vec<InterfaceShape> {
        vec![InterfaceShape::new("ICalculator")
            .method("add", &["a", "b"])
            .method("subtract", &["a", "b"])
            .method("multiply", &["a", "b"])
            .method("divide", &["a", "b"])
            .cached_property("name", false)
            .property("memory", true)]
    }

    fn invoke(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
        args: &mut [Value],
    ) -> std::result::Result<Value, RemoteException> {
        let op = member.member.as_str();
        arithmetic(op, number(args, 0)?, number(args, 1)?)
    }

    fn get_property(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
    ) -> std::result::Result<Value, RemoteException> {
        match member.member.as_str() {
            "name" => Ok(Value::from(self.name.as_str())),
            "memory" => Ok(self
                .memory
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()),
            _ => Err(RemoteException::member_not_found(member)),
        }
    }

    fn set_property(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
        value: Value,
    ) -> std::result::Result<(), RemoteException> {
        match member.member.as_str() {
            "memory" if value.is_plain() => {
                *self.memory.lock().unwrap_or_else(PoisonError::into_inner) = value;
                Ok(())
            }
            "memory" => Err(RemoteException::invalid_argument("memory holds plain values only")),
            _ => Err(RemoteException::member_not_found(member)),
        }
    }
}

/// Register `Calculator` (optional name argument) and `math.square`.
pub fn register(server: &RemotingServer) -> Result<()> {
    server.register_type("Calculator", |_ctx, args| {
        let name = args.first().and_then(Value::as_str).unwrap_or("calculator");
        Ok(Arc::new(Calculator::new(name)) as Arc<dyn RemoteObject>)
    })?;
    server.register_static_method("math.square", |_ctx, args| square(number(args, 0)?))
}
