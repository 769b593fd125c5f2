//! Report policy validation
//!
//! A [`ValidationOptions`] record drives every check; any option left unset
//! is skipped. The defaults encode the floor this deployment requires and
//! are plain data: callers that need different floors build their own
//! record instead of patching constants.

use super::report::{Report, SnpPolicy, TcbVersion};
use crate::error::{Error, Result};

/// Required guest policy. "Unauthorized" capabilities (`debug`,
/// `migrate_ma`, `smt`, `cxl_allowed`, `mem_aes_256_xts`) are rejected when
/// the report enables them without permission; "required restrictions"
/// (`single_socket`, `mem_aes_256_xts`, `rapl_dis`,
/// `ciphertext_hiding_dram`, `page_swap_disabled`) are rejected when
/// demanded here but absent from the report.
#[derive(Debug, Clone)]
pub struct GuestPolicyRequirement {
    pub abi_major: u8,
    pub abi_minor: u8,
    pub smt: bool,
    pub migrate_ma: bool,
    pub debug: bool,
    pub single_socket: bool,
    pub cxl_allowed: bool,
    pub mem_aes_256_xts: bool,
    pub rapl_dis: bool,
    pub ciphertext_hiding_dram: bool,
    pub page_swap_disabled: bool,
}

/// Required platform info, with the same two-sided logic as the guest
/// policy: enabled-but-unpermitted platform features reject, and
/// `alias_check_complete` rejects when required but not reported.
#[derive(Debug, Clone)]
pub struct PlatformInfoRequirement {
    pub smt_enabled: bool,
    pub tsme_enabled: bool,
    pub ecc_enabled: bool,
    pub rapl_disabled: bool,
    pub ciphertext_hiding_dram_enabled: bool,
    pub alias_check_complete: bool,
    pub tio_enabled: bool,
}

/// Everything the validator may check about a report.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    pub guest_policy: GuestPolicyRequirement,
    pub platform_info: Option<PlatformInfoRequirement>,
    pub minimum_guest_svn: Option<u32>,
    pub minimum_build: Option<u8>,
    /// Packed firmware version `(major << 8) | minor`.
    pub minimum_version: Option<u16>,
    pub minimum_tcb: Option<TcbVersion>,
    pub minimum_launch_tcb: Option<TcbVersion>,
    /// `true` is not implemented and fails loudly.
    pub permit_provisional_firmware: bool,
    /// Not implemented; fails loudly when set.
    pub require_author_key: bool,
    /// Not implemented; fails loudly when set.
    pub require_id_block: bool,
    pub vmpl: Option<u32>,
    pub report_data: Option<Vec<u8>>,
    pub host_data: Option<Vec<u8>>,
    pub measurement: Option<Vec<u8>>,
    pub chip_id: Option<Vec<u8>>,
    pub image_id: Option<Vec<u8>>,
    pub family_id: Option<Vec<u8>>,
    pub report_id: Option<Vec<u8>>,
    pub report_id_ma: Option<Vec<u8>>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            guest_policy: GuestPolicyRequirement {
                abi_major: 0,
                abi_minor: 0,
                smt: true,
                migrate_ma: false,
                debug: false,
                single_socket: false,
                cxl_allowed: false,
                mem_aes_256_xts: false,
                rapl_dis: false,
                ciphertext_hiding_dram: false,
                page_swap_disabled: false,
            },
            platform_info: Some(PlatformInfoRequirement {
                smt_enabled: true,
                tsme_enabled: true,
                ecc_enabled: false,
                rapl_disabled: false,
                ciphertext_hiding_dram_enabled: false,
                alias_check_complete: false,
                tio_enabled: false,
            }),
            minimum_guest_svn: None,
            minimum_build: Some(21),
            minimum_version: Some((1 << 8) | 55),
            minimum_tcb: Some(TcbVersion {
                bl_spl: 0x07,
                tee_spl: 0x00,
                snp_spl: 0x0e,
                ucode_spl: 0x48,
            }),
            minimum_launch_tcb: Some(TcbVersion {
                bl_spl: 0x07,
                tee_spl: 0x00,
                snp_spl: 0x0e,
                ucode_spl: 0x48,
            }),
            permit_provisional_firmware: false,
            require_author_key: false,
            require_id_block: false,
            vmpl: None,
            report_data: None,
            host_data: None,
            measurement: None,
            chip_id: None,
            image_id: None,
            family_id: None,
            report_id: None,
            report_id_ma: None,
        }
    }
}

/// Validate a parsed report against the options.
pub fn validate_report(report: &Report, options: &ValidationOptions) -> Result<()> {
    // Unsupported knobs fail loudly so callers never believe an
    // unimplemented rule is being enforced.
    if options.require_author_key {
        return Err(Error::attestation("require_author_key is not yet implemented"));
    }
    if options.require_id_block {
        return Err(Error::attestation("require_id_block is not yet implemented"));
    }
    if options.permit_provisional_firmware {
        return Err(Error::attestation(
            "permit_provisional_firmware is not yet implemented",
        ));
    }

    let policy = report.policy()?;
    check_guest_policy(&policy, &options.guest_policy)?;

    if let Some(required) = &options.platform_info {
        check_platform_info(report, required)?;
    }

    if let Some(min_svn) = options.minimum_guest_svn {
        if report.guest_svn() < min_svn {
            return Err(Error::attestation(format!(
                "guest SVN {} below required minimum {min_svn}",
                report.guest_svn()
            )));
        }
    }

    if let Some(min_build) = options.minimum_build {
        for (which, build) in [
            ("current", report.current_build()),
            ("committed", report.committed_build()),
        ] {
            if build < min_build {
                return Err(Error::attestation(format!(
                    "{which} firmware build {build} below required minimum {min_build}"
                )));
            }
        }
    }

    if let Some(min_version) = options.minimum_version {
        for (which, major, minor) in [
            ("current", report.current_major(), report.current_minor()),
            ("committed", report.committed_major(), report.committed_minor()),
        ] {
            let version = ((major as u16) << 8) | minor as u16;
            if version < min_version {
                return Err(Error::attestation(format!(
                    "{which} firmware version {major}.{minor} below required minimum {}.{}",
                    min_version >> 8,
                    min_version & 0xFF
                )));
            }
        }
    }

    if let Some(min_tcb) = &options.minimum_tcb {
        for (which, tcb) in [
            ("current", report.current_tcb()),
            ("committed", report.committed_tcb()),
            ("reported", report.reported_tcb()),
        ] {
            if !tcb.meets_minimum(min_tcb) {
                return Err(Error::attestation(format!(
                    "{which} TCB ({tcb}) below required minimum ({min_tcb})"
                )));
            }
        }
    }

    if let Some(min_launch_tcb) = &options.minimum_launch_tcb {
        let launch = report.launch_tcb();
        if !launch.meets_minimum(min_launch_tcb) {
            return Err(Error::attestation(format!(
                "launch TCB ({launch}) below required minimum ({min_launch_tcb})"
            )));
        }
    }

    // permit_provisional_firmware=false: the running firmware must be the
    // committed firmware.
    if report.current_build() != report.committed_build()
        || report.current_major() != report.committed_major()
        || report.current_minor() != report.committed_minor()
    {
        return Err(Error::attestation(
            "provisional firmware: current and committed versions differ",
        ));
    }
    if report.current_tcb() != report.committed_tcb() {
        return Err(Error::attestation(
            "provisional firmware: current and committed TCB differ",
        ));
    }

    if let Some(required_vmpl) = options.vmpl {
        if required_vmpl > 3 || report.vmpl() != required_vmpl {
            return Err(Error::attestation(format!(
                "VMPL {} does not match required VMPL {required_vmpl} (0..3)",
                report.vmpl()
            )));
        }
    }

    let field_checks: [(&str, &Option<Vec<u8>>, &[u8]); 8] = [
        ("report_data", &options.report_data, report.report_data()),
        ("host_data", &options.host_data, report.host_data()),
        ("measurement", &options.measurement, report.measurement()),
        ("chip_id", &options.chip_id, report.chip_id()),
        ("image_id", &options.image_id, report.image_id()),
        ("family_id", &options.family_id, report.family_id()),
        ("report_id", &options.report_id, report.report_id()),
        ("report_id_ma", &options.report_id_ma, report.report_id_ma()),
    ];
    for (name, expected, actual) in field_checks {
        if let Some(expected) = expected {
            if expected.as_slice() != actual {
                return Err(Error::attestation(format!(
                    "report field {name} does not match the required value"
                )));
            }
        }
    }

    Ok(())
}

fn check_guest_policy(policy: &SnpPolicy, required: &GuestPolicyRequirement) -> Result<()> {
    if policy.abi_major < required.abi_major
        || (policy.abi_major == required.abi_major && policy.abi_minor < required.abi_minor)
    {
        return Err(Error::attestation(format!(
            "report ABI version {}.{} below required {}.{}",
            policy.abi_major, policy.abi_minor, required.abi_major, required.abi_minor
        )));
    }

    // Capabilities the report may not enable without permission.
    let unauthorized = [
        ("debug", policy.debug, required.debug),
        ("migrate_ma", policy.migrate_ma, required.migrate_ma),
        ("smt", policy.smt, required.smt),
        ("cxl_allowed", policy.cxl_allowed, required.cxl_allowed),
        ("mem_aes_256_xts", policy.mem_aes_256_xts, required.mem_aes_256_xts),
    ];
    for (name, reported, permitted) in unauthorized {
        if reported && !permitted {
            return Err(Error::attestation(format!(
                "guest policy enables unauthorized capability {name}"
            )));
        }
    }

    // Restrictions the report must carry when demanded.
    let required_restrictions = [
        ("single_socket", policy.single_socket, required.single_socket),
        ("mem_aes_256_xts", policy.mem_aes_256_xts, required.mem_aes_256_xts),
        ("rapl_dis", policy.rapl_dis, required.rapl_dis),
        (
            "ciphertext_hiding_dram",
            policy.ciphertext_hiding_dram,
            required.ciphertext_hiding_dram,
        ),
        (
            "page_swap_disabled",
            policy.page_swap_disabled,
            required.page_swap_disabled,
        ),
    ];
    for (name, reported, demanded) in required_restrictions {
        if demanded && !reported {
            return Err(Error::attestation(format!(
                "guest policy lacks required restriction {name}"
            )));
        }
    }

    Ok(())
}

fn check_platform_info(report: &Report, required: &PlatformInfoRequirement) -> Result<()> {
    let info = report.platform_info();

    let unauthorized = [
        ("smt", info.smt_enabled, required.smt_enabled),
        ("tsme", info.tsme_enabled, required.tsme_enabled),
        ("ecc", info.ecc_enabled, required.ecc_enabled),
        ("rapl_disabled", info.rapl_disabled, required.rapl_disabled),
        (
            "ciphertext_hiding_dram",
            info.ciphertext_hiding_dram_enabled,
            required.ciphertext_hiding_dram_enabled,
        ),
        ("tio", info.tio_enabled, required.tio_enabled),
    ];
    for (name, reported, permitted) in unauthorized {
        if reported && !permitted {
            return Err(Error::attestation(format!(
                "platform enables unauthorized feature {name}"
            )));
        }
    }

    if required.alias_check_complete && !info.alias_check_complete {
        return Err(Error::attestation(
            "platform has not completed the required alias check",
        ));
    }

    Ok(())
}
