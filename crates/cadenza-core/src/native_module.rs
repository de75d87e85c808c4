//! Native module descriptors.
//!
//! A native module is a built-in DSL operation (`add`, `sin`, …) with a
//! fixed argument signature. Module calls appear as nodes in the
//! execution graph; lowering later selects a concrete task function for
//! each call.

use std::fmt;
use std::sync::Arc;

/// 64-bit module identifier: `{library_id, module_id}`, written
/// big-endian on the wire so compiled programs are portable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeModuleUid(u64);

impl NativeModuleUid {
    pub const fn new(library_id: u32, module_id: u32) -> Self {
        Self(((library_id as u64) << 32) | module_id as u64)
    }

    pub const fn library_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn module_id(self) -> u32 {
        self.0 as u32
    }

    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Debug for NativeModuleUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module {}:{}", self.library_id(), self.module_id())
    }
}

/// The primitive kind of a value flowing through the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Real,
    Bool,
    Str,
}

/// A compile-time constant value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    Real(f32),
    Bool(bool),
    Str(Arc<str>),
}

impl ConstantValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Real(_) => ValueKind::Real,
            Self::Bool(_) => ValueKind::Bool,
            Self::Str(_) => ValueKind::Str,
        }
    }

    /// Bit-exact equality: reals compare by bit pattern, since constants
    /// are compile-time-folded values, never measured signals.
    pub fn bit_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Real(a), Self::Real(b)) => a.to_bits() == b.to_bits(),
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            _ => false,
        }
    }
}

/// Direction of a module argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleQualifier {
    /// A signal input.
    In,
    /// A signal output.
    Out,
    /// An input that must resolve to a compile-time constant
    /// (e.g. a sample path).
    Constant,
}

/// One argument of a native module's signature.
#[derive(Debug, Clone, Copy)]
pub struct ModuleArg {
    pub name: &'static str,
    pub qualifier: ModuleQualifier,
    pub kind: ValueKind,
}

/// Evaluates a module call whose inputs are all compile-time constants.
///
/// Receives the input values in argument order and produces the output
/// value. Errors abort the compile of the enclosing program.
pub type CompileTimeEval = fn(&[ConstantValue]) -> Result<ConstantValue, String>;

/// Descriptor for one native module.
pub struct NativeModule {
    pub uid: NativeModuleUid,
    pub name: &'static str,
    /// Ordered argument list; inputs and outputs interleaved as declared.
    pub args: Vec<ModuleArg>,
    pub compile_time_eval: Option<CompileTimeEval>,
}

impl NativeModule {
    pub fn in_arg_count(&self) -> usize {
        self.args
            .iter()
            .filter(|a| a.qualifier != ModuleQualifier::Out)
            .count()
    }

    pub fn out_arg_count(&self) -> usize {
        self.args
            .iter()
            .filter(|a| a.qualifier == ModuleQualifier::Out)
            .count()
    }

    /// The argument-list index of the `index`th input argument.
    pub fn in_arg_index(&self, index: usize) -> usize {
        self.args
            .iter()
            .enumerate()
            .filter(|(_, a)| a.qualifier != ModuleQualifier::Out)
            .nth(index)
            .map(|(i, _)| i)
            .expect("input argument index out of range")
    }

    /// The argument-list index of the `index`th output argument.
    pub fn out_arg_index(&self, index: usize) -> usize {
        self.args
            .iter()
            .enumerate()
            .filter(|(_, a)| a.qualifier == ModuleQualifier::Out)
            .nth(index)
            .map(|(i, _)| i)
            .expect("output argument index out of range")
    }
}

impl fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("args", &self.args)
            .field("compile_time_eval", &self.compile_time_eval.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_round_trips_big_endian() {
        let uid = NativeModuleUid::new(3, 0x1234);

        assert_eq!(uid.library_id(), 3);
        assert_eq!(uid.module_id(), 0x1234);
        assert_eq!(NativeModuleUid::from_be_bytes(uid.to_be_bytes()), uid);
        // Big-endian layout: library id occupies the leading bytes.
        assert_eq!(uid.to_be_bytes()[..4], 3u32.to_be_bytes());
    }

    #[test]
    fn constant_bit_equality_distinguishes_zero_signs() {
        let plus = ConstantValue::Real(0.0);
        let minus = ConstantValue::Real(-0.0);

        assert!(plus.bit_eq(&ConstantValue::Real(0.0)));
        assert!(!plus.bit_eq(&minus));
    }
}
