/// Process-wide install defaults. All flags are off by default.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Install to the SD card storage instead of built-in user storage.
    pub sd_card_install: bool,
    pub allow_downgrade: bool,
    pub skip_if_already_installed: bool,
    /// Install only the tickets of the container.
    pub ticket_only: bool,
    pub skip_base: bool,
    pub skip_patch: bool,
    pub skip_addon: bool,
    pub skip_data_patch: bool,
    pub skip_ticket: bool,
    pub skip_nca_hash_verify: bool,
    pub skip_rsa_header_fixed_key_verify: bool,
    /// Accepted for interface parity; NPDM verification is not performed.
    pub skip_rsa_npdm_fixed_key_verify: bool,
    /// Keep the GameCard distribution bit instead of rewriting it.
    pub ignore_distribution_bit: bool,
    pub convert_to_common_ticket: bool,
    /// Inject the decrypted title key into the key area and drop the rights
    /// id, making the content playable without its ticket.
    pub convert_to_standard_crypto: bool,
    /// Rewrap the key area under master key generation 0.
    pub lower_master_key: bool,
    /// Zero `required_system_version` in the content meta.
    pub lower_system_version: bool,
    /// Smaller buffers and a write throttle for file-based emuMMC targets.
    pub file_based_emummc: bool,
}

/// Per-install values for the verification and rewrite flags; missing
/// fields fall back to the process defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverride {
    pub sd_card_install: Option<bool>,
    pub skip_nca_hash_verify: Option<bool>,
    pub skip_rsa_header_fixed_key_verify: Option<bool>,
    pub skip_rsa_npdm_fixed_key_verify: Option<bool>,
    pub ignore_distribution_bit: Option<bool>,
    pub convert_to_common_ticket: Option<bool>,
    pub convert_to_standard_crypto: Option<bool>,
    pub lower_master_key: Option<bool>,
    pub lower_system_version: Option<bool>,
}

impl Config {
    pub fn with_override(&self, overrides: &ConfigOverride) -> Config {
        let mut config = self.clone();
        macro_rules! apply {
            ($($field:ident),*) => {
                $(
                    if let Some(value) = overrides.$field {
                        config.$field = value;
                    }
                )*
            };
        }
        apply!(
            sd_card_install,
            skip_nca_hash_verify,
            skip_rsa_header_fixed_key_verify,
            skip_rsa_npdm_fixed_key_verify,
            ignore_distribution_bit,
            convert_to_common_ticket,
            convert_to_standard_crypto,
            lower_master_key,
            lower_system_version
        );
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_defaults() {
        let defaults = Config {
            skip_nca_hash_verify: true,
            lower_master_key: true,
            ..Config::default()
        };
        let overrides = ConfigOverride {
            skip_nca_hash_verify: Some(false),
            ignore_distribution_bit: Some(true),
            ..ConfigOverride::default()
        };

        let config = defaults.with_override(&overrides);
        assert!(!config.skip_nca_hash_verify);
        assert!(config.ignore_distribution_bit);
        assert!(config.lower_master_key);
    }
}
