use super::{value::Value, vm::Vm};

pub type NativeFn = fn(&Vm, usize) -> Result<Value, String>;

/// Registered into the globals map before execution starts. Arity is
/// checked by the call convention, so the functions themselves only read
/// their arguments.
pub const NATIVES: [(&str, u8, NativeFn); 1] = [("clock", 0, clock)];

fn clock(vm: &Vm, _argc: usize) -> Result<Value, String> {
    Ok(Value::Number(vm.uptime()))
}
