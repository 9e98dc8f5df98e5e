//! Capability probing.
//!
//! Before a module is compiled the engine is asked whether it accepts the
//! optional `wasm:js-string` builtins. The answer is captured once per
//! compile entry point and carried unchanged into every instance and every
//! deferred compile of the session.

use bitflags::bitflags;

use crate::engine::Engine;

bitflags! {
    /// Optional engine extensions negotiated before compiling.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        /// `wasm:js-string` imports are recognised as builtins.
        const STRING_BUILTINS = 1 << 0;
    }
}

/// Minimal module importing `wasm:js-string` `cast` as `(externref) -> externref`.
const STRING_BUILTINS_PROBE: &[u8] = &[
    0x00, 0x61, 0x73, 0x6d, // magic
    0x01, 0x00, 0x00, 0x00, // version
    // type section: [(func (param externref) (result externref))]
    0x01, 0x06, 0x01, 0x60, 0x01, 0x6f, 0x01, 0x6f,
    // import section: "wasm:js-string" "cast" (func (type 0))
    0x02, 0x17, 0x01, 0x0e, b'w', b'a', b's', b'm', b':', b'j', b's', b'-', b's', b't', b'r',
    b'i', b'n', b'g', 0x04, b'c', b'a', b's', b't', 0x00, 0x00,
];

/// Detect the optional extensions supported by `engine`.
///
/// A failed validation means "unsupported" and is never reported as an error.
pub fn probe(engine: &Engine) -> Capabilities {
    let mut capabilities = Capabilities::empty();

    match engine.validate(STRING_BUILTINS_PROBE, Capabilities::STRING_BUILTINS) {
        Ok(()) => capabilities |= Capabilities::STRING_BUILTINS,
        Err(e) => log::debug!("[bridge] string builtins unavailable: {}", e),
    }

    log::debug!("[bridge] negotiated capabilities: {:?}", capabilities);
    capabilities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BridgeConfig;

    #[test]
    fn test_probe_snippet_is_valid_module() {
        let engine = wasmtime::Engine::default();
        assert!(wasmtime::Module::validate(&engine, STRING_BUILTINS_PROBE).is_ok());
    }

    #[test]
    fn test_probe_with_builtins_enabled() {
        let engine = Engine::new(BridgeConfig::default()).unwrap();
        assert_eq!(probe(&engine), Capabilities::STRING_BUILTINS);
    }

    #[test]
    fn test_probe_with_builtins_disabled() {
        let config = BridgeConfig {
            enable_string_builtins: false,
            ..BridgeConfig::default()
        };
        let engine = Engine::new(config).unwrap();
        assert!(probe(&engine).is_empty());
    }

    #[test]
    fn test_probe_is_stable() {
        let engine = Engine::new(BridgeConfig::default()).unwrap();
        assert_eq!(probe(&engine), probe(&engine));
    }
}
