//! `wasm:js-string` builtins.
//!
//! The same implementation backs both bindings: the native one, used when
//! the string-builtins capability was negotiated, and the polyfill, used
//! otherwise when the configuration asks for it.

use std::cmp::Ordering;

use anyhow::bail;
use wasmtime::{ExternRef, FuncType, Linker, ValType};

use crate::capability::Capabilities;
use crate::instance::BridgeState;
use crate::value::{HostString, HostValue, MarshalError};
use crate::BridgeConfig;

/// Import namespace of the string builtins.
pub const NAMESPACE: &str = "wasm:js-string";

/// How the `wasm:js-string` namespace was bound for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringBuiltins {
    /// Negotiated as engine builtins; signatures checked at compile time.
    Native,
    /// Bound as ordinary host functions.
    Polyfill,
    /// Not bound; modules importing the namespace fail to link.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    I32,
    Ref,
}

impl Slot {
    fn of(ty: &ValType) -> Option<Slot> {
        match ty {
            ValType::I32 => Some(Slot::I32),
            ValType::I64 | ValType::F32 | ValType::F64 | ValType::V128 => None,
            _ => Some(Slot::Ref),
        }
    }
}

/// Signature of one string builtin.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Builtin {
    name: &'static str,
    params: &'static [Slot],
    results: &'static [Slot],
}

const BUILTINS: &[Builtin] = &[
    Builtin { name: "cast", params: &[Slot::Ref], results: &[Slot::Ref] },
    Builtin { name: "test", params: &[Slot::Ref], results: &[Slot::I32] },
    Builtin { name: "fromCharCode", params: &[Slot::I32], results: &[Slot::Ref] },
    Builtin { name: "fromCodePoint", params: &[Slot::I32], results: &[Slot::Ref] },
    Builtin { name: "charCodeAt", params: &[Slot::Ref, Slot::I32], results: &[Slot::I32] },
    Builtin { name: "codePointAt", params: &[Slot::Ref, Slot::I32], results: &[Slot::I32] },
    Builtin { name: "length", params: &[Slot::Ref], results: &[Slot::I32] },
    Builtin { name: "concat", params: &[Slot::Ref, Slot::Ref], results: &[Slot::Ref] },
    Builtin {
        name: "substring",
        params: &[Slot::Ref, Slot::I32, Slot::I32],
        results: &[Slot::Ref],
    },
    Builtin { name: "equals", params: &[Slot::Ref, Slot::Ref], results: &[Slot::I32] },
    Builtin { name: "compare", params: &[Slot::Ref, Slot::Ref], results: &[Slot::I32] },
];

impl Builtin {
    /// Look up a builtin by import name.
    pub(crate) fn from_name(name: &str) -> Option<&'static Builtin> {
        BUILTINS.iter().find(|b| b.name == name)
    }

    /// Fail unless `ty` is exactly the builtin's signature.
    pub(crate) fn check(&self, ty: &FuncType) -> anyhow::Result<()> {
        let params: Vec<Option<Slot>> = ty.params().map(|t| Slot::of(&t)).collect();
        let results: Vec<Option<Slot>> = ty.results().map(|t| Slot::of(&t)).collect();
        let same = |found: &[Option<Slot>], expected: &[Slot]| {
            found.len() == expected.len()
                && found.iter().zip(expected).all(|(f, e)| *f == Some(*e))
        };
        if !same(&params, self.params) || !same(&results, self.results) {
            bail!("string builtin `{}` imported with the wrong signature", self.name);
        }
        Ok(())
    }
}

/// Bind the namespace according to the negotiated capabilities.
pub(crate) fn bind(
    linker: &mut Linker<BridgeState>,
    capabilities: Capabilities,
    config: &BridgeConfig,
) -> anyhow::Result<StringBuiltins> {
    let mode = if capabilities.contains(Capabilities::STRING_BUILTINS) {
        StringBuiltins::Native
    } else if config.string_polyfill {
        StringBuiltins::Polyfill
    } else {
        StringBuiltins::Absent
    };

    if mode != StringBuiltins::Absent {
        define(linker)?;
    }
    log::debug!("[bridge] string builtins bound as {:?}", mode);
    Ok(mode)
}

type Ref = Option<ExternRef>;

fn define(linker: &mut Linker<BridgeState>) -> anyhow::Result<()> {
    linker.func_wrap(NAMESPACE, "cast", |v: Ref| -> anyhow::Result<Ref> {
        Ok(HostValue::String(cast(&v)?).to_extern())
    })?;
    linker.func_wrap(NAMESPACE, "test", |v: Ref| -> anyhow::Result<i32> {
        Ok(matches!(value(&v)?, HostValue::String(_)) as i32)
    })?;
    linker.func_wrap(NAMESPACE, "fromCharCode", |code: i32| -> Ref {
        HostValue::String(from_char_code(code)).to_extern()
    })?;
    linker.func_wrap(NAMESPACE, "fromCodePoint", |code: i32| -> anyhow::Result<Ref> {
        Ok(HostValue::String(from_code_point(code)?).to_extern())
    })?;
    linker.func_wrap(NAMESPACE, "charCodeAt", |s: Ref, index: i32| -> anyhow::Result<i32> {
        Ok(char_code_at(&cast(&s)?, index)?)
    })?;
    linker.func_wrap(NAMESPACE, "codePointAt", |s: Ref, index: i32| -> anyhow::Result<i32> {
        Ok(code_point_at(&cast(&s)?, index)?)
    })?;
    linker.func_wrap(NAMESPACE, "length", |s: Ref| -> anyhow::Result<i32> {
        Ok(cast(&s)?.len() as i32)
    })?;
    linker.func_wrap(NAMESPACE, "concat", |a: Ref, b: Ref| -> anyhow::Result<Ref> {
        Ok(HostValue::String(cast(&a)?.concat(&cast(&b)?)).to_extern())
    })?;
    linker.func_wrap(
        NAMESPACE,
        "substring",
        |s: Ref, start: i32, end: i32| -> anyhow::Result<Ref> {
            Ok(HostValue::String(substring(&cast(&s)?, start, end)).to_extern())
        },
    )?;
    linker.func_wrap(NAMESPACE, "equals", |a: Ref, b: Ref| -> anyhow::Result<i32> {
        Ok(equals(&a, &b)?)
    })?;
    linker.func_wrap(NAMESPACE, "compare", |a: Ref, b: Ref| -> anyhow::Result<i32> {
        Ok(compare(&cast(&a)?, &cast(&b)?))
    })?;
    Ok(())
}

fn value(r: &Ref) -> Result<HostValue, MarshalError> {
    HostValue::from_extern(r.as_ref())
}

/// Trap unless the reference is a host string.
fn cast(r: &Ref) -> Result<HostString, MarshalError> {
    value(r)?.as_string().cloned()
}

fn index(s: &HostString, index: i32) -> Result<usize, MarshalError> {
    let i = index as u32 as usize;
    if i >= s.len() {
        return Err(MarshalError::OutOfBounds {
            offset: i,
            len: 1,
            size: s.len(),
        });
    }
    Ok(i)
}

fn from_char_code(code: i32) -> HostString {
    HostString::from_char_code(code as u32 as u16)
}

fn from_code_point(code: i32) -> Result<HostString, MarshalError> {
    let cp = code as u32;
    if cp > 0x10ffff {
        return Err(MarshalError::OutOfBounds {
            offset: cp as usize,
            len: 1,
            size: 0x110000,
        });
    }
    if cp < 0x10000 {
        return Ok(HostString::from_char_code(cp as u16));
    }
    let v = cp - 0x10000;
    let high = 0xd800 + (v >> 10) as u16;
    let low = 0xdc00 + (v & 0x3ff) as u16;
    Ok(HostString::from_units(vec![high, low]))
}

fn char_code_at(s: &HostString, i: i32) -> Result<i32, MarshalError> {
    let i = index(s, i)?;
    Ok(i32::from(s.units()[i]))
}

fn code_point_at(s: &HostString, i: i32) -> Result<i32, MarshalError> {
    let i = index(s, i)?;
    let units = s.units();
    let first = units[i];
    if (0xd800..0xdc00).contains(&first) {
        if let Some(&second) = units.get(i + 1) {
            if (0xdc00..0xe000).contains(&second) {
                let cp = 0x10000 + ((u32::from(first) - 0xd800) << 10) + (u32::from(second) - 0xdc00);
                return Ok(cp as i32);
            }
        }
    }
    Ok(i32::from(first))
}

/// Unsigned indices; empty unless `start < end` within the string.
fn substring(s: &HostString, start: i32, end: i32) -> HostString {
    let start = start as u32 as usize;
    let end = end as u32 as usize;
    if start > end || start > s.len() {
        return HostString::empty();
    }
    s.substring(start, end)
}

/// Strict string equality; two nulls are equal.
fn equals(a: &Ref, b: &Ref) -> Result<i32, MarshalError> {
    match (value(a)?, value(b)?) {
        (HostValue::Null, HostValue::Null) => Ok(1),
        (HostValue::Null, HostValue::String(_)) | (HostValue::String(_), HostValue::Null) => Ok(0),
        (HostValue::String(a), HostValue::String(b)) => Ok((a == b) as i32),
        (HostValue::String(_), other) | (other, _) => Err(MarshalError::TypeMismatch {
            expected: "string",
            found: other.kind(),
        }),
    }
}

/// Code unit order.
fn compare(a: &HostString, b: &HostString) -> i32 {
    match a.cmp(b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}
