//! The core native module library and its task functions.
//!
//! Every arithmetic module gets a family of task function variants, one
//! per input shape: in-place variants for branchless (single-consumer)
//! inputs, scalar variants for compile-time-constant inputs, and a
//! general buffer/buffer form. Mappings are registered branchless-first
//! so lowering prefers the in-place variants.

use crate::native_module::{
    ConstantValue, ModuleArg, ModuleQualifier, NativeModule, NativeModuleUid, ValueKind,
};
use crate::registry::{NativeModuleRegistry, TaskFunctionRegistry};
use crate::task_function::{
    MappingInput, TaskArg, TaskExecute, TaskFunction, TaskFunctionUid, TaskMapping, TaskQualifier,
};

/// Library id of the core module library.
pub const CORE_LIBRARY: u32 = 0;

/// UIDs of the core native modules.
pub mod modules {
    use super::{NativeModuleUid, CORE_LIBRARY};

    pub const ADD: NativeModuleUid = NativeModuleUid::new(CORE_LIBRARY, 1);
    pub const SUBTRACT: NativeModuleUid = NativeModuleUid::new(CORE_LIBRARY, 2);
    pub const MULTIPLY: NativeModuleUid = NativeModuleUid::new(CORE_LIBRARY, 3);
    pub const DIVIDE: NativeModuleUid = NativeModuleUid::new(CORE_LIBRARY, 4);
    pub const NEGATE: NativeModuleUid = NativeModuleUid::new(CORE_LIBRARY, 5);
    pub const SIN: NativeModuleUid = NativeModuleUid::new(CORE_LIBRARY, 6);
    pub const AND: NativeModuleUid = NativeModuleUid::new(CORE_LIBRARY, 7);
    pub const OR: NativeModuleUid = NativeModuleUid::new(CORE_LIBRARY, 8);
    pub const NOT: NativeModuleUid = NativeModuleUid::new(CORE_LIBRARY, 9);
}

// Task id = module id * 16 + variant, so each module owns a small id
// range for its variants.
const VARIANT_INOUT_IN: u32 = 0;
const VARIANT_IN_INOUT: u32 = 1;
const VARIANT_INOUT_CONST: u32 = 2;
const VARIANT_CONST_INOUT: u32 = 3;
const VARIANT_OUT: u32 = 4;
const VARIANT_OUT_CONST: u32 = 5;
const VARIANT_CONST_OUT: u32 = 6;

fn task_uid(module: NativeModuleUid, variant: u32) -> TaskFunctionUid {
    TaskFunctionUid::new(module.library_id(), module.module_id() * 16 + variant)
}

/// The full core registry pair used by the compiler and engine.
pub fn native_module_registry() -> NativeModuleRegistry {
    let mut registry = NativeModuleRegistry::new();

    registry.register(add_module()).unwrap();
    registry.register(subtract_module()).unwrap();
    registry.register(multiply_module()).unwrap();
    registry.register(divide_module()).unwrap();
    registry.register(negate_module()).unwrap();
    registry.register(sin_module()).unwrap();
    registry.register(and_module()).unwrap();
    registry.register(or_module()).unwrap();
    registry.register(not_module()).unwrap();

    registry
}

pub fn task_function_registry() -> TaskFunctionRegistry {
    let mut registry = TaskFunctionRegistry::new();

    register_binary_real(
        &mut registry,
        modules::ADD,
        [
            "add_inout_in",
            "add_in_inout",
            "add_inout_const",
            "add_const_inout",
            "add_out",
            "add_out_const",
            "add_const_out",
        ],
        |a, b| a + b,
    );
    register_binary_real(
        &mut registry,
        modules::SUBTRACT,
        [
            "subtract_inout_in",
            "subtract_in_inout",
            "subtract_inout_const",
            "subtract_const_inout",
            "subtract_out",
            "subtract_out_const",
            "subtract_const_out",
        ],
        |a, b| a - b,
    );
    register_binary_real(
        &mut registry,
        modules::MULTIPLY,
        [
            "multiply_inout_in",
            "multiply_in_inout",
            "multiply_inout_const",
            "multiply_const_inout",
            "multiply_out",
            "multiply_out_const",
            "multiply_const_out",
        ],
        |a, b| a * b,
    );
    register_binary_real(
        &mut registry,
        modules::DIVIDE,
        [
            "divide_inout_in",
            "divide_in_inout",
            "divide_inout_const",
            "divide_const_inout",
            "divide_out",
            "divide_out_const",
            "divide_const_out",
        ],
        |a, b| a / b,
    );
    register_unary_real(
        &mut registry,
        modules::NEGATE,
        ["negate_inout", "negate_out"],
        |x| -x,
    );
    register_unary_real(&mut registry, modules::SIN, ["sin_inout", "sin_out"], |x| {
        x.sin()
    });
    register_binary_bool(
        &mut registry,
        modules::AND,
        [
            "and_inout_in",
            "and_in_inout",
            "and_inout_const",
            "and_const_inout",
            "and_out",
            "and_out_const",
            "and_const_out",
        ],
        |a, b| a & b,
    );
    register_binary_bool(
        &mut registry,
        modules::OR,
        [
            "or_inout_in",
            "or_in_inout",
            "or_inout_const",
            "or_const_inout",
            "or_out",
            "or_out_const",
            "or_const_out",
        ],
        |a, b| a | b,
    );
    register_unary_bool(&mut registry, modules::NOT, ["not_inout", "not_out"], |w| !w);

    registry
}

// ---------------------------------------------------------------------
// Native module descriptors
// ---------------------------------------------------------------------

fn binary_module(
    name: &'static str,
    uid: NativeModuleUid,
    kind: ValueKind,
    eval: crate::native_module::CompileTimeEval,
) -> NativeModule {
    NativeModule {
        uid,
        name,
        args: vec![
            ModuleArg {
                name: "a",
                qualifier: ModuleQualifier::In,
                kind,
            },
            ModuleArg {
                name: "b",
                qualifier: ModuleQualifier::In,
                kind,
            },
            ModuleArg {
                name: "result",
                qualifier: ModuleQualifier::Out,
                kind,
            },
        ],
        compile_time_eval: Some(eval),
    }
}

fn unary_module(
    name: &'static str,
    uid: NativeModuleUid,
    kind: ValueKind,
    eval: crate::native_module::CompileTimeEval,
) -> NativeModule {
    NativeModule {
        uid,
        name,
        args: vec![
            ModuleArg {
                name: "x",
                qualifier: ModuleQualifier::In,
                kind,
            },
            ModuleArg {
                name: "result",
                qualifier: ModuleQualifier::Out,
                kind,
            },
        ],
        compile_time_eval: Some(eval),
    }
}

pub fn add_module() -> NativeModule {
    binary_module("add", modules::ADD, ValueKind::Real, eval_add)
}

pub fn subtract_module() -> NativeModule {
    binary_module("subtract", modules::SUBTRACT, ValueKind::Real, eval_subtract)
}

pub fn multiply_module() -> NativeModule {
    binary_module("multiply", modules::MULTIPLY, ValueKind::Real, eval_multiply)
}

pub fn divide_module() -> NativeModule {
    binary_module("divide", modules::DIVIDE, ValueKind::Real, eval_divide)
}

pub fn negate_module() -> NativeModule {
    unary_module("negate", modules::NEGATE, ValueKind::Real, eval_negate)
}

pub fn sin_module() -> NativeModule {
    unary_module("sin", modules::SIN, ValueKind::Real, eval_sin)
}

pub fn and_module() -> NativeModule {
    binary_module("and", modules::AND, ValueKind::Bool, eval_and)
}

pub fn or_module() -> NativeModule {
    binary_module("or", modules::OR, ValueKind::Bool, eval_or)
}

pub fn not_module() -> NativeModule {
    unary_module("not", modules::NOT, ValueKind::Bool, eval_not)
}

// ---------------------------------------------------------------------
// Compile-time evaluators
// ---------------------------------------------------------------------

fn real2(
    args: &[ConstantValue],
    name: &str,
    op: fn(f32, f32) -> f32,
) -> Result<ConstantValue, String> {
    match args {
        [ConstantValue::Real(a), ConstantValue::Real(b)] => Ok(ConstantValue::Real(op(*a, *b))),
        _ => Err(format!("{name} expects two real operands")),
    }
}

fn real1(args: &[ConstantValue], name: &str, op: fn(f32) -> f32) -> Result<ConstantValue, String> {
    match args {
        [ConstantValue::Real(x)] => Ok(ConstantValue::Real(op(*x))),
        _ => Err(format!("{name} expects one real operand")),
    }
}

fn bool2(
    args: &[ConstantValue],
    name: &str,
    op: fn(bool, bool) -> bool,
) -> Result<ConstantValue, String> {
    match args {
        [ConstantValue::Bool(a), ConstantValue::Bool(b)] => Ok(ConstantValue::Bool(op(*a, *b))),
        _ => Err(format!("{name} expects two bool operands")),
    }
}

fn eval_add(args: &[ConstantValue]) -> Result<ConstantValue, String> {
    real2(args, "add", |a, b| a + b)
}

fn eval_subtract(args: &[ConstantValue]) -> Result<ConstantValue, String> {
    real2(args, "subtract", |a, b| a - b)
}

fn eval_multiply(args: &[ConstantValue]) -> Result<ConstantValue, String> {
    real2(args, "multiply", |a, b| a * b)
}

fn eval_divide(args: &[ConstantValue]) -> Result<ConstantValue, String> {
    real2(args, "divide", |a, b| a / b)
}

fn eval_negate(args: &[ConstantValue]) -> Result<ConstantValue, String> {
    real1(args, "negate", |x| -x)
}

fn eval_sin(args: &[ConstantValue]) -> Result<ConstantValue, String> {
    real1(args, "sin", f32::sin)
}

fn eval_and(args: &[ConstantValue]) -> Result<ConstantValue, String> {
    bool2(args, "and", |a, b| a && b)
}

fn eval_or(args: &[ConstantValue]) -> Result<ConstantValue, String> {
    bool2(args, "or", |a, b| a || b)
}

fn eval_not(args: &[ConstantValue]) -> Result<ConstantValue, String> {
    match args {
        [ConstantValue::Bool(x)] => Ok(ConstantValue::Bool(!x)),
        _ => Err("not expects one bool operand".to_string()),
    }
}

// ---------------------------------------------------------------------
// Task function executors
// ---------------------------------------------------------------------

fn real_arg(name: &'static str, qualifier: TaskQualifier, unshared: bool) -> TaskArg {
    TaskArg {
        name,
        kind: ValueKind::Real,
        qualifier,
        unshared,
    }
}

fn bool_arg(name: &'static str, qualifier: TaskQualifier, unshared: bool) -> TaskArg {
    TaskArg {
        name,
        kind: ValueKind::Bool,
        qualifier,
        unshared,
    }
}

fn task(uid: TaskFunctionUid, name: &'static str, args: Vec<TaskArg>, execute: TaskExecute) -> TaskFunction {
    TaskFunction {
        uid,
        name,
        args,
        memory_query: None,
        init: None,
        voice_init: None,
        execute,
    }
}

fn binary_real_inout_in(op: fn(f32, f32) -> f32) -> TaskExecute {
    Box::new(move |ctx| {
        let b = ctx.real_buffer_in(1);
        let a = ctx.real_buffer_out(0);

        match (a.constant_value(), b.constant_value()) {
            (Some(x), Some(y)) => a.fill_constant(op(x, y)),
            (Some(x), None) => {
                for (s, &bv) in a.samples.iter_mut().zip(b.samples) {
                    *s = op(x, bv);
                }
                a.set_varying();
            }
            (None, Some(y)) => {
                for s in a.samples.iter_mut() {
                    *s = op(*s, y);
                }
            }
            (None, None) => {
                for (s, &bv) in a.samples.iter_mut().zip(b.samples) {
                    *s = op(*s, bv);
                }
            }
        }
    })
}

fn binary_real_in_inout(op: fn(f32, f32) -> f32) -> TaskExecute {
    Box::new(move |ctx| {
        let a = ctx.real_buffer_in(0);
        let b = ctx.real_buffer_out(1);

        match (a.constant_value(), b.constant_value()) {
            (Some(x), Some(y)) => b.fill_constant(op(x, y)),
            (Some(x), None) => {
                for s in b.samples.iter_mut() {
                    *s = op(x, *s);
                }
            }
            (None, Some(y)) => {
                for (s, &av) in b.samples.iter_mut().zip(a.samples) {
                    *s = op(av, y);
                }
                b.set_varying();
            }
            (None, None) => {
                for (s, &av) in b.samples.iter_mut().zip(a.samples) {
                    *s = op(av, *s);
                }
            }
        }
    })
}

fn binary_real_inout_const(op: fn(f32, f32) -> f32) -> TaskExecute {
    Box::new(move |ctx| {
        let y = ctx.real_constant_in(1);
        let a = ctx.real_buffer_out(0);

        if let Some(x) = a.constant_value() {
            a.fill_constant(op(x, y));
        } else {
            for s in a.samples.iter_mut() {
                *s = op(*s, y);
            }
        }
    })
}

fn binary_real_const_inout(op: fn(f32, f32) -> f32) -> TaskExecute {
    Box::new(move |ctx| {
        let x = ctx.real_constant_in(0);
        let b = ctx.real_buffer_out(1);

        if let Some(y) = b.constant_value() {
            b.fill_constant(op(x, y));
        } else {
            for s in b.samples.iter_mut() {
                *s = op(x, *s);
            }
        }
    })
}

fn binary_real_out(op: fn(f32, f32) -> f32) -> TaskExecute {
    Box::new(move |ctx| {
        let a = ctx.real_buffer_in(1);
        let b = ctx.real_buffer_in(2);
        let out = ctx.real_buffer_out(0);

        match (a.constant_value(), b.constant_value()) {
            (Some(x), Some(y)) => out.fill_constant(op(x, y)),
            (Some(x), None) => {
                for (o, &bv) in out.samples.iter_mut().zip(b.samples) {
                    *o = op(x, bv);
                }
                out.set_varying();
            }
            (None, Some(y)) => {
                for (o, &av) in out.samples.iter_mut().zip(a.samples) {
                    *o = op(av, y);
                }
                out.set_varying();
            }
            (None, None) => {
                for ((o, &av), &bv) in out.samples.iter_mut().zip(a.samples).zip(b.samples) {
                    *o = op(av, bv);
                }
                out.set_varying();
            }
        }
    })
}

fn binary_real_out_const(op: fn(f32, f32) -> f32) -> TaskExecute {
    Box::new(move |ctx| {
        let a = ctx.real_buffer_in(1);
        let y = ctx.real_constant_in(2);
        let out = ctx.real_buffer_out(0);

        if let Some(x) = a.constant_value() {
            out.fill_constant(op(x, y));
        } else {
            for (o, &av) in out.samples.iter_mut().zip(a.samples) {
                *o = op(av, y);
            }
            out.set_varying();
        }
    })
}

fn binary_real_const_out(op: fn(f32, f32) -> f32) -> TaskExecute {
    Box::new(move |ctx| {
        let x = ctx.real_constant_in(1);
        let b = ctx.real_buffer_in(2);
        let out = ctx.real_buffer_out(0);

        if let Some(y) = b.constant_value() {
            out.fill_constant(op(x, y));
        } else {
            for (o, &bv) in out.samples.iter_mut().zip(b.samples) {
                *o = op(x, bv);
            }
            out.set_varying();
        }
    })
}

fn register_binary_real(
    registry: &mut TaskFunctionRegistry,
    module: NativeModuleUid,
    names: [&'static str; 7],
    op: fn(f32, f32) -> f32,
) {
    use MappingInput::{BranchlessVariable as Bl, Constant as C, Variable as V};
    use TaskQualifier::{Constant, In, InOut, Out};

    let variants: [(u32, Vec<TaskArg>, TaskExecute, [MappingInput; 2], Vec<u32>); 7] = [
        (
            VARIANT_INOUT_IN,
            vec![real_arg("a", InOut, true), real_arg("b", In, false)],
            binary_real_inout_in(op),
            [Bl, V],
            vec![0, 1, 0],
        ),
        (
            VARIANT_IN_INOUT,
            vec![real_arg("a", In, false), real_arg("b", InOut, true)],
            binary_real_in_inout(op),
            [V, Bl],
            vec![0, 1, 1],
        ),
        (
            VARIANT_INOUT_CONST,
            vec![real_arg("a", InOut, true), real_arg("b", Constant, false)],
            binary_real_inout_const(op),
            [Bl, C],
            vec![0, 1, 0],
        ),
        (
            VARIANT_CONST_INOUT,
            vec![real_arg("a", Constant, false), real_arg("b", InOut, true)],
            binary_real_const_inout(op),
            [C, Bl],
            vec![0, 1, 1],
        ),
        (
            VARIANT_OUT,
            vec![
                real_arg("result", Out, false),
                real_arg("a", In, false),
                real_arg("b", In, false),
            ],
            binary_real_out(op),
            [V, V],
            vec![1, 2, 0],
        ),
        (
            VARIANT_OUT_CONST,
            vec![
                real_arg("result", Out, false),
                real_arg("a", In, false),
                real_arg("b", Constant, false),
            ],
            binary_real_out_const(op),
            [V, C],
            vec![1, 2, 0],
        ),
        (
            VARIANT_CONST_OUT,
            vec![
                real_arg("result", Out, false),
                real_arg("a", Constant, false),
                real_arg("b", In, false),
            ],
            binary_real_const_out(op),
            [C, V],
            vec![1, 2, 0],
        ),
    ];

    for (name, (variant, args, execute, pattern, arg_map)) in names.into_iter().zip(variants) {
        let uid = task_uid(module, variant);
        registry.register_function(task(uid, name, args, execute)).unwrap();
        registry
            .register_mapping(TaskMapping {
                module,
                input_pattern: pattern.to_vec(),
                task: uid,
                arg_to_task_arg: arg_map,
            })
            .unwrap();
    }
}

fn unary_real_inout(op: fn(f32) -> f32) -> TaskExecute {
    Box::new(move |ctx| {
        let a = ctx.real_buffer_out(0);

        if let Some(x) = a.constant_value() {
            a.fill_constant(op(x));
        } else {
            for s in a.samples.iter_mut() {
                *s = op(*s);
            }
        }
    })
}

fn unary_real_out_in(op: fn(f32) -> f32) -> TaskExecute {
    Box::new(move |ctx| {
        let x = ctx.real_buffer_in(1);
        let out = ctx.real_buffer_out(0);

        if let Some(v) = x.constant_value() {
            out.fill_constant(op(v));
        } else {
            for (o, &xv) in out.samples.iter_mut().zip(x.samples) {
                *o = op(xv);
            }
            out.set_varying();
        }
    })
}

fn register_unary_real(
    registry: &mut TaskFunctionRegistry,
    module: NativeModuleUid,
    names: [&'static str; 2],
    op: fn(f32) -> f32,
) {
    use MappingInput::{BranchlessVariable as Bl, Variable as V};
    use TaskQualifier::{In, InOut, Out};

    let inout_uid = task_uid(module, VARIANT_INOUT_IN);
    registry
        .register_function(task(
            inout_uid,
            names[0],
            vec![real_arg("x", InOut, true)],
            unary_real_inout(op),
        ))
        .unwrap();
    registry
        .register_mapping(TaskMapping {
            module,
            input_pattern: vec![Bl],
            task: inout_uid,
            arg_to_task_arg: vec![0, 0],
        })
        .unwrap();

    let out_uid = task_uid(module, VARIANT_OUT);
    registry
        .register_function(task(
            out_uid,
            names[1],
            vec![real_arg("result", Out, false), real_arg("x", In, false)],
            unary_real_out_in(op),
        ))
        .unwrap();
    registry
        .register_mapping(TaskMapping {
            module,
            input_pattern: vec![V],
            task: out_uid,
            arg_to_task_arg: vec![1, 0],
        })
        .unwrap();
}

#[inline]
fn splat(value: bool) -> u32 {
    if value {
        !0
    } else {
        0
    }
}

fn binary_bool_inout_in(op: fn(u32, u32) -> u32) -> TaskExecute {
    Box::new(move |ctx| {
        let b = ctx.bool_buffer_in(1);
        let a = ctx.bool_buffer_out(0);

        match (a.constant_value(), b.constant_value()) {
            (Some(x), Some(y)) => a.fill_constant(op(splat(x), splat(y)) & 1 != 0),
            (Some(x), None) => {
                for (w, &bw) in a.words.iter_mut().zip(b.words) {
                    *w = op(splat(x), bw);
                }
                a.set_varying();
            }
            (None, Some(y)) => {
                for w in a.words.iter_mut() {
                    *w = op(*w, splat(y));
                }
            }
            (None, None) => {
                for (w, &bw) in a.words.iter_mut().zip(b.words) {
                    *w = op(*w, bw);
                }
            }
        }
    })
}

fn binary_bool_in_inout(op: fn(u32, u32) -> u32) -> TaskExecute {
    Box::new(move |ctx| {
        let a = ctx.bool_buffer_in(0);
        let b = ctx.bool_buffer_out(1);

        match (a.constant_value(), b.constant_value()) {
            (Some(x), Some(y)) => b.fill_constant(op(splat(x), splat(y)) & 1 != 0),
            (Some(x), None) => {
                for w in b.words.iter_mut() {
                    *w = op(splat(x), *w);
                }
            }
            (None, Some(y)) => {
                for (w, &aw) in b.words.iter_mut().zip(a.words) {
                    *w = op(aw, splat(y));
                }
                b.set_varying();
            }
            (None, None) => {
                for (w, &aw) in b.words.iter_mut().zip(a.words) {
                    *w = op(aw, *w);
                }
            }
        }
    })
}

fn binary_bool_inout_const(op: fn(u32, u32) -> u32) -> TaskExecute {
    Box::new(move |ctx| {
        let y = splat(ctx.bool_constant_in(1));
        let a = ctx.bool_buffer_out(0);

        if let Some(x) = a.constant_value() {
            a.fill_constant(op(splat(x), y) & 1 != 0);
        } else {
            for w in a.words.iter_mut() {
                *w = op(*w, y);
            }
        }
    })
}

fn binary_bool_const_inout(op: fn(u32, u32) -> u32) -> TaskExecute {
    Box::new(move |ctx| {
        let x = splat(ctx.bool_constant_in(0));
        let b = ctx.bool_buffer_out(1);

        if let Some(y) = b.constant_value() {
            b.fill_constant(op(x, splat(y)) & 1 != 0);
        } else {
            for w in b.words.iter_mut() {
                *w = op(x, *w);
            }
        }
    })
}

fn binary_bool_out(op: fn(u32, u32) -> u32) -> TaskExecute {
    Box::new(move |ctx| {
        let a = ctx.bool_buffer_in(1);
        let b = ctx.bool_buffer_in(2);
        let out = ctx.bool_buffer_out(0);

        match (a.constant_value(), b.constant_value()) {
            (Some(x), Some(y)) => out.fill_constant(op(splat(x), splat(y)) & 1 != 0),
            (Some(x), None) => {
                for (o, &bw) in out.words.iter_mut().zip(b.words) {
                    *o = op(splat(x), bw);
                }
                out.set_varying();
            }
            (None, Some(y)) => {
                for (o, &aw) in out.words.iter_mut().zip(a.words) {
                    *o = op(aw, splat(y));
                }
                out.set_varying();
            }
            (None, None) => {
                for ((o, &aw), &bw) in out.words.iter_mut().zip(a.words).zip(b.words) {
                    *o = op(aw, bw);
                }
                out.set_varying();
            }
        }
    })
}

fn binary_bool_out_const(op: fn(u32, u32) -> u32) -> TaskExecute {
    Box::new(move |ctx| {
        let a = ctx.bool_buffer_in(1);
        let y = splat(ctx.bool_constant_in(2));
        let out = ctx.bool_buffer_out(0);

        if let Some(x) = a.constant_value() {
            out.fill_constant(op(splat(x), y) & 1 != 0);
        } else {
            for (o, &aw) in out.words.iter_mut().zip(a.words) {
                *o = op(aw, y);
            }
            out.set_varying();
        }
    })
}

fn binary_bool_const_out(op: fn(u32, u32) -> u32) -> TaskExecute {
    Box::new(move |ctx| {
        let x = splat(ctx.bool_constant_in(1));
        let b = ctx.bool_buffer_in(2);
        let out = ctx.bool_buffer_out(0);

        if let Some(y) = b.constant_value() {
            out.fill_constant(op(x, splat(y)) & 1 != 0);
        } else {
            for (o, &bw) in out.words.iter_mut().zip(b.words) {
                *o = op(x, bw);
            }
            out.set_varying();
        }
    })
}

fn register_binary_bool(
    registry: &mut TaskFunctionRegistry,
    module: NativeModuleUid,
    names: [&'static str; 7],
    op: fn(u32, u32) -> u32,
) {
    use MappingInput::{BranchlessVariable as Bl, Constant as C, Variable as V};
    use TaskQualifier::{Constant, In, InOut, Out};

    let variants: [(u32, Vec<TaskArg>, TaskExecute, [MappingInput; 2], Vec<u32>); 7] = [
        (
            VARIANT_INOUT_IN,
            vec![bool_arg("a", InOut, true), bool_arg("b", In, false)],
            binary_bool_inout_in(op),
            [Bl, V],
            vec![0, 1, 0],
        ),
        (
            VARIANT_IN_INOUT,
            vec![bool_arg("a", In, false), bool_arg("b", InOut, true)],
            binary_bool_in_inout(op),
            [V, Bl],
            vec![0, 1, 1],
        ),
        (
            VARIANT_INOUT_CONST,
            vec![bool_arg("a", InOut, true), bool_arg("b", Constant, false)],
            binary_bool_inout_const(op),
            [Bl, C],
            vec![0, 1, 0],
        ),
        (
            VARIANT_CONST_INOUT,
            vec![bool_arg("a", Constant, false), bool_arg("b", InOut, true)],
            binary_bool_const_inout(op),
            [C, Bl],
            vec![0, 1, 1],
        ),
        (
            VARIANT_OUT,
            vec![
                bool_arg("result", Out, false),
                bool_arg("a", In, false),
                bool_arg("b", In, false),
            ],
            binary_bool_out(op),
            [V, V],
            vec![1, 2, 0],
        ),
        (
            VARIANT_OUT_CONST,
            vec![
                bool_arg("result", Out, false),
                bool_arg("a", In, false),
                bool_arg("b", Constant, false),
            ],
            binary_bool_out_const(op),
            [V, C],
            vec![1, 2, 0],
        ),
        (
            VARIANT_CONST_OUT,
            vec![
                bool_arg("result", Out, false),
                bool_arg("a", Constant, false),
                bool_arg("b", In, false),
            ],
            binary_bool_const_out(op),
            [C, V],
            vec![1, 2, 0],
        ),
    ];

    for (name, (variant, args, execute, pattern, arg_map)) in names.into_iter().zip(variants) {
        let uid = task_uid(module, variant);
        registry.register_function(task(uid, name, args, execute)).unwrap();
        registry
            .register_mapping(TaskMapping {
                module,
                input_pattern: pattern.to_vec(),
                task: uid,
                arg_to_task_arg: arg_map,
            })
            .unwrap();
    }
}

fn unary_bool_inout(op: fn(u32) -> u32) -> TaskExecute {
    Box::new(move |ctx| {
        let a = ctx.bool_buffer_out(0);

        if let Some(x) = a.constant_value() {
            a.fill_constant(op(splat(x)) & 1 != 0);
        } else {
            for w in a.words.iter_mut() {
                *w = op(*w);
            }
        }
    })
}

fn unary_bool_out_in(op: fn(u32) -> u32) -> TaskExecute {
    Box::new(move |ctx| {
        let x = ctx.bool_buffer_in(1);
        let out = ctx.bool_buffer_out(0);

        if let Some(v) = x.constant_value() {
            out.fill_constant(op(splat(v)) & 1 != 0);
        } else {
            for (o, &xw) in out.words.iter_mut().zip(x.words) {
                *o = op(xw);
            }
            out.set_varying();
        }
    })
}

fn register_unary_bool(
    registry: &mut TaskFunctionRegistry,
    module: NativeModuleUid,
    names: [&'static str; 2],
    op: fn(u32) -> u32,
) {
    use MappingInput::{BranchlessVariable as Bl, Variable as V};
    use TaskQualifier::{In, InOut, Out};

    let inout_uid = task_uid(module, VARIANT_INOUT_IN);
    registry
        .register_function(task(
            inout_uid,
            names[0],
            vec![bool_arg("x", InOut, true)],
            unary_bool_inout(op),
        ))
        .unwrap();
    registry
        .register_mapping(TaskMapping {
            module,
            input_pattern: vec![Bl],
            task: inout_uid,
            arg_to_task_arg: vec![0, 0],
        })
        .unwrap();

    let out_uid = task_uid(module, VARIANT_OUT);
    registry
        .register_function(task(
            out_uid,
            names[1],
            vec![bool_arg("result", Out, false), bool_arg("x", In, false)],
            unary_bool_out_in(op),
        ))
        .unwrap();
    registry
        .register_mapping(TaskMapping {
            module,
            input_pattern: vec![V],
            task: out_uid,
            arg_to_task_arg: vec![1, 0],
        })
        .unwrap();
}
