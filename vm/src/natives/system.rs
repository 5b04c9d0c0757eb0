use log::info;
use object::{Scalar, Value};

use crate::natives::{expect_string, native_error};
use crate::{Runtime, RuntimeError};

pub fn print(
    rt: &mut Runtime,
    _instance: Option<Value>,
    args: &[Value],
) -> Result<Option<Value>, RuntimeError> {
    let [text] = args else {
        return Err(native_error("system::Print", "expected one argument"));
    };
    let line = expect_string(rt, "system::Print", *text)?;
    info!("program output: {line}");
    rt.output().push_line(line);
    Ok(None)
}

pub fn length(
    rt: &mut Runtime,
    _instance: Option<Value>,
    args: &[Value],
) -> Result<Option<Value>, RuntimeError> {
    let [text] = args else {
        return Err(native_error("system::Length", "expected one argument"));
    };
    let len = expect_string(rt, "system::Length", *text)?.len();
    let len = i32::try_from(len)
        .map_err(|_| native_error("system::Length", "string too long"))?;
    rt.allocate_scalar(Scalar::I32(len)).map(Some)
}

pub fn concat(
    rt: &mut Runtime,
    _instance: Option<Value>,
    args: &[Value],
) -> Result<Option<Value>, RuntimeError> {
    let [left, right] = args else {
        return Err(native_error("system::Concat", "expected two arguments"));
    };
    let mut joined = expect_string(rt, "system::Concat", *left)?;
    joined.push_str(&expect_string(rt, "system::Concat", *right)?);
    rt.allocate_string(&joined).map(Some)
}
