//! RPC identifier space & provider muxing.
//!
//! The 48-bit name hash is computed once by the transport's
//! `register_rpc` (`margo_transport::loopback` truncates and left-shifts
//! it into the high bits already, i.e. the id it returns is
//! `mux(hash, 0)`). Everything here operates on that base id.

/// Provider id reserved to mean "no provider".
pub const NO_PROVIDER: u16 = 0;

/// Combine a (hash<<16)-shaped base id with a provider id.
pub fn mux(base_id: u64, provider: u16) -> u64 {
    (base_id & !0xffff) | provider as u64
}

/// Recover `(hash<<16 base id, provider)` from an effective id.
pub fn demux(effective_id: u64) -> (u64, u16) {
    (effective_id & !0xffff, (effective_id & 0xffff) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_then_demux_recovers_provider() {
        let base = 0xabcd_ef01_2345_0000u64;
        for provider in [0u16, 1, 42, 65535] {
            let effective = mux(base, provider);
            let (recovered_base, recovered_provider) = demux(effective);
            assert_eq!(recovered_base, base);
            assert_eq!(recovered_provider, provider);
        }
    }

    #[test]
    fn mux_ignores_low_bits_of_base() {
        // A base id with garbage in its low 16 bits (shouldn't happen in
        // practice, since register_rpc always returns a shifted hash, but
        // mux must still discard it rather than OR it into the result).
        let dirty_base = 0x1111_2222_3333_4444u64;
        assert_eq!(mux(dirty_base, 0x99), 0x1111_2222_3333_0099);
    }

    #[test]
    fn no_provider_is_zero() {
        assert_eq!(NO_PROVIDER, 0);
        assert_eq!(demux(mux(0xdead_beef_0000_0000, NO_PROVIDER)).1, NO_PROVIDER);
    }
}
