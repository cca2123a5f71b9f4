//! Floating-point math.

use mlua::{Lua, UserData, UserDataFields, UserDataMethods, Value, Variadic};

use crate::error::ModuleError;
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;

pub const NAME: &str = "pglua/math";

pub fn construct(_loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(MathModule))
}

#[derive(Clone, Copy)]
pub struct MathModule;

impl CapabilityModule for MathModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(*self).map(Value::UserData)
    }
}

/// Round to an integer when the result fits, otherwise stay a float.
fn integral(x: f64) -> Value {
    if x.is_finite() && x >= i64::MIN as f64 && x < i64::MAX as f64 {
        Value::Integer(x as i64)
    } else {
        Value::Number(x)
    }
}

fn fold(values: Variadic<f64>, pick: fn(f64, f64) -> f64) -> mlua::Result<f64> {
    values
        .iter()
        .copied()
        .reduce(pick)
        .ok_or_else(|| mlua::Error::RuntimeError("expected at least one number".to_string()))
}

impl UserData for MathModule {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_function_get("pi", |_, _| Ok(std::f64::consts::PI));
        fields.add_field_function_get("e", |_, _| Ok(std::f64::consts::E));
        fields.add_field_function_get("inf", |_, _| Ok(f64::INFINITY));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("floor", |_, x: f64| Ok(integral(x.floor())));
        methods.add_function("ceil", |_, x: f64| Ok(integral(x.ceil())));
        methods.add_function("round", |_, x: f64| Ok(integral(x.round())));
        methods.add_function("abs", |_, x: f64| Ok(x.abs()));
        methods.add_function("sqrt", |_, x: f64| Ok(x.sqrt()));
        methods.add_function("pow", |_, (x, y): (f64, f64)| Ok(x.powf(y)));
        methods.add_function("exp", |_, x: f64| Ok(x.exp()));
        methods.add_function("log", |_, (x, base): (f64, Option<f64>)| {
            Ok(match base {
                Some(base) => x.log(base),
                None => x.ln(),
            })
        });
        methods.add_function("sin", |_, x: f64| Ok(x.sin()));
        methods.add_function("cos", |_, x: f64| Ok(x.cos()));
        methods.add_function("tan", |_, x: f64| Ok(x.tan()));
        methods.add_function("atan2", |_, (y, x): (f64, f64)| Ok(y.atan2(x)));
        methods.add_function("hypot", |_, (x, y): (f64, f64)| Ok(x.hypot(y)));
        methods.add_function("min", |_, values: Variadic<f64>| fold(values, f64::min));
        methods.add_function("max", |_, values: Variadic<f64>| fold(values, f64::max));
    }
}
