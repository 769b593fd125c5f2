//! AMD SEV-SNP attestation report parsing
//!
//! The report is a fixed-layout binary structure; field offsets follow the
//! AMD SEV-SNP ABI specification. The parser keeps the raw bytes and
//! materializes typed views on demand: policy, platform info, and signer
//! info are bit-packed words that unpack into records when asked for.

use crate::error::{Error, Result};

/// Report size in bytes (0x4A0) for the supported report versions.
pub const REPORT_SIZE: usize = 0x4A0;

const OFFSET_VERSION: usize = 0x00;
const OFFSET_GUEST_SVN: usize = 0x04;
const OFFSET_POLICY: usize = 0x08;
const OFFSET_FAMILY_ID: usize = 0x10;
const OFFSET_IMAGE_ID: usize = 0x20;
const OFFSET_VMPL: usize = 0x30;
const OFFSET_SIGNATURE_ALGO: usize = 0x34;
const OFFSET_CURRENT_TCB: usize = 0x38;
const OFFSET_PLATFORM_INFO: usize = 0x40;
const OFFSET_SIGNER_INFO: usize = 0x48;
const OFFSET_REPORT_DATA: usize = 0x50;
const OFFSET_MEASUREMENT: usize = 0x90;
const OFFSET_HOST_DATA: usize = 0xC0;
const OFFSET_ID_KEY_DIGEST: usize = 0xE0;
const OFFSET_AUTHOR_KEY_DIGEST: usize = 0x110;
const OFFSET_REPORT_ID: usize = 0x140;
const OFFSET_REPORT_ID_MA: usize = 0x160;
const OFFSET_REPORTED_TCB: usize = 0x180;
const OFFSET_CPUID_FAMILY: usize = 0x188;
const OFFSET_CPUID_MODEL: usize = 0x189;
const OFFSET_CHIP_ID: usize = 0x1A0;
const OFFSET_COMMITTED_TCB: usize = 0x1E0;
const OFFSET_CURRENT_BUILD: usize = 0x1E8;
const OFFSET_CURRENT_MINOR: usize = 0x1E9;
const OFFSET_CURRENT_MAJOR: usize = 0x1EA;
const OFFSET_COMMITTED_BUILD: usize = 0x1EC;
const OFFSET_COMMITTED_MINOR: usize = 0x1ED;
const OFFSET_COMMITTED_MAJOR: usize = 0x1EE;
const OFFSET_LAUNCH_TCB: usize = 0x1F0;
const OFFSET_SIGNATURE: usize = 0x2A0;

pub const REPORT_DATA_SIZE: usize = 64;
pub const MEASUREMENT_SIZE: usize = 48;
pub const CHIP_ID_SIZE: usize = 64;
const SIGNATURE_SIZE: usize = 512;

// AMD ECDSA P-384 signature: two little-endian 72-byte components,
// each carrying a 48-byte scalar.
const SIG_COMPONENT_SIZE: usize = 72;
const SIG_VALUE_SIZE: usize = 48;

// Guest policy bit positions.
const POLICY_SMT_BIT: u64 = 16;
const POLICY_RESERVED1_BIT: u64 = 17; // must be 1
const POLICY_MIGRATE_MA_BIT: u64 = 18;
const POLICY_DEBUG_BIT: u64 = 19;
const POLICY_SINGLE_SOCKET_BIT: u64 = 20;
const POLICY_CXL_ALLOWED_BIT: u64 = 21;
const POLICY_MEM_AES_256_XTS_BIT: u64 = 22;
const POLICY_RAPL_DIS_BIT: u64 = 23;
const POLICY_CIPHERTEXT_HIDING_DRAM_BIT: u64 = 24;
const POLICY_PAGE_SWAP_DISABLE_BIT: u64 = 25;

// Platform info bit positions.
const PLATFORM_SMT_BIT: u64 = 0;
const PLATFORM_TSME_BIT: u64 = 1;
const PLATFORM_ECC_BIT: u64 = 2;
const PLATFORM_RAPL_DIS_BIT: u64 = 3;
const PLATFORM_CIPHERTEXT_HIDING_DRAM_BIT: u64 = 4;
const PLATFORM_ALIAS_CHECK_COMPLETE_BIT: u64 = 5;
const PLATFORM_TIO_BIT: u64 = 6;

/// TCB security patch levels, packed into a u64 with byte positions
/// `blSpl=0, teeSpl=1, snpSpl=6, ucodeSpl=7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcbVersion {
    pub bl_spl: u8,
    pub tee_spl: u8,
    pub snp_spl: u8,
    pub ucode_spl: u8,
}

impl TcbVersion {
    pub fn from_u64(value: u64) -> Self {
        Self {
            bl_spl: (value & 0xFF) as u8,
            tee_spl: ((value >> 8) & 0xFF) as u8,
            snp_spl: ((value >> 48) & 0xFF) as u8,
            ucode_spl: ((value >> 56) & 0xFF) as u8,
        }
    }

    pub fn as_u64(&self) -> u64 {
        (self.bl_spl as u64)
            | ((self.tee_spl as u64) << 8)
            | ((self.snp_spl as u64) << 48)
            | ((self.ucode_spl as u64) << 56)
    }

    /// A TCB meets a minimum iff every component does.
    pub fn meets_minimum(&self, min: &TcbVersion) -> bool {
        self.bl_spl >= min.bl_spl
            && self.tee_spl >= min.tee_spl
            && self.snp_spl >= min.snp_spl
            && self.ucode_spl >= min.ucode_spl
    }
}

impl std::fmt::Display for TcbVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bl={:#x} tee={:#x} snp={:#x} ucode={:#x}",
            self.bl_spl, self.tee_spl, self.snp_spl, self.ucode_spl
        )
    }
}

/// Guest policy, unpacked from the report's 64-bit policy word.
#[derive(Debug, Clone)]
pub struct SnpPolicy {
    pub abi_minor: u8,
    pub abi_major: u8,
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

impl SnpPolicy {
    pub fn from_u64(policy: u64) -> Result<Self> {
        if policy & (1 << POLICY_RESERVED1_BIT) == 0 {
            return Err(Error::attestation("policy reserved bit 17 must be 1"));
        }
        if policy & 0xFFFF_FFFF_FC00_0000 != 0 {
            return Err(Error::attestation("policy reserved bits [63:26] must be zero"));
        }

        let bit = |pos: u64| policy & (1 << pos) != 0;
        Ok(Self {
            abi_minor: (policy & 0xFF) as u8,
            abi_major: ((policy >> 8) & 0xFF) as u8,
            smt: bit(POLICY_SMT_BIT),
            migrate_ma: bit(POLICY_MIGRATE_MA_BIT),
            debug: bit(POLICY_DEBUG_BIT),
            single_socket: bit(POLICY_SINGLE_SOCKET_BIT),
            cxl_allowed: bit(POLICY_CXL_ALLOWED_BIT),
            mem_aes_256_xts: bit(POLICY_MEM_AES_256_XTS_BIT),
            rapl_dis: bit(POLICY_RAPL_DIS_BIT),
            ciphertext_hiding_dram: bit(POLICY_CIPHERTEXT_HIDING_DRAM_BIT),
            page_swap_disabled: bit(POLICY_PAGE_SWAP_DISABLE_BIT),
        })
    }
}

/// Platform state, unpacked from the report's platform-info word.
#[derive(Debug, Clone)]
pub struct SnpPlatformInfo {
    pub smt_enabled: bool,
    pub tsme_enabled: bool,
    pub ecc_enabled: bool,
    pub rapl_disabled: bool,
    pub ciphertext_hiding_dram_enabled: bool,
    pub alias_check_complete: bool,
    pub tio_enabled: bool,
}

impl SnpPlatformInfo {
    pub fn from_u64(info: u64) -> Self {
        let bit = |pos: u64| info & (1 << pos) != 0;
        Self {
            smt_enabled: bit(PLATFORM_SMT_BIT),
            tsme_enabled: bit(PLATFORM_TSME_BIT),
            ecc_enabled: bit(PLATFORM_ECC_BIT),
            rapl_disabled: bit(PLATFORM_RAPL_DIS_BIT),
            ciphertext_hiding_dram_enabled: bit(PLATFORM_CIPHERTEXT_HIDING_DRAM_BIT),
            alias_check_complete: bit(PLATFORM_ALIAS_CHECK_COMPLETE_BIT),
            tio_enabled: bit(PLATFORM_TIO_BIT),
        }
    }
}

/// Which key family signed the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningKey {
    VcekReportSigner,
    VlekReportSigner,
    NoneReportSigner,
}

/// Signer info, unpacked from the report's 32-bit signer-info word:
/// `maskChipKey` at bit 0, `authorKeyEn` at bit 1, the signing key kind in
/// bits 2..4.
#[derive(Debug, Clone)]
pub struct SignerInfo {
    pub signing_key: SigningKey,
    pub mask_chip_key: bool,
    pub author_key_en: bool,
}

impl SignerInfo {
    pub fn from_u32(info: u32) -> Result<Self> {
        let signing_key = match (info >> 2) & 0x7 {
            0 => SigningKey::VcekReportSigner,
            1 => SigningKey::VlekReportSigner,
            7 => SigningKey::NoneReportSigner,
            other => {
                return Err(Error::attestation(format!(
                    "undefined report signing key value {other}"
                )))
            }
        };
        Ok(Self {
            signing_key,
            mask_chip_key: info & 0x1 != 0,
            author_key_en: info & 0x2 != 0,
        })
    }
}

/// A parsed SEV-SNP attestation report.
///
/// Owns the raw bytes; every accessor reads at a fixed offset, so there is
/// one canonical representation and the bit-packed words are unpacked only
/// when a typed view is requested.
#[derive(Debug, Clone)]
pub struct Report {
    raw: Vec<u8>,
}

impl Report {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 4 {
            return Err(Error::attestation(format!(
                "report too short: {} bytes",
                raw.len()
            )));
        }
        let version = u32::from_le_bytes(raw[OFFSET_VERSION..OFFSET_VERSION + 4].try_into().unwrap());
        if !(2..=5).contains(&version) {
            return Err(Error::attestation(format!(
                "unsupported report version {version}, expected 2-5"
            )));
        }
        if raw.len() != REPORT_SIZE {
            return Err(Error::attestation(format!(
                "invalid report size for version {version}: expected {REPORT_SIZE}, got {}",
                raw.len()
            )));
        }
        Ok(Self { raw: raw.to_vec() })
    }

    fn u32_at(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.raw[offset..offset + 4].try_into().unwrap())
    }

    fn u64_at(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.raw[offset..offset + 8].try_into().unwrap())
    }

    pub fn version(&self) -> u32 {
        self.u32_at(OFFSET_VERSION)
    }

    pub fn guest_svn(&self) -> u32 {
        self.u32_at(OFFSET_GUEST_SVN)
    }

    pub fn policy(&self) -> Result<SnpPolicy> {
        SnpPolicy::from_u64(self.u64_at(OFFSET_POLICY))
    }

    pub fn family_id(&self) -> &[u8] {
        &self.raw[OFFSET_FAMILY_ID..OFFSET_FAMILY_ID + 16]
    }

    pub fn image_id(&self) -> &[u8] {
        &self.raw[OFFSET_IMAGE_ID..OFFSET_IMAGE_ID + 16]
    }

    pub fn vmpl(&self) -> u32 {
        self.u32_at(OFFSET_VMPL)
    }

    /// Signature algorithm identifier; 1 is ECDSA P-384 with SHA-384.
    pub fn signature_algo(&self) -> u32 {
        self.u32_at(OFFSET_SIGNATURE_ALGO)
    }

    pub fn current_tcb(&self) -> TcbVersion {
        TcbVersion::from_u64(self.u64_at(OFFSET_CURRENT_TCB))
    }

    pub fn platform_info(&self) -> SnpPlatformInfo {
        SnpPlatformInfo::from_u64(self.u64_at(OFFSET_PLATFORM_INFO))
    }

    pub fn signer_info(&self) -> Result<SignerInfo> {
        SignerInfo::from_u32(self.u32_at(OFFSET_SIGNER_INFO))
    }

    pub fn report_data(&self) -> &[u8] {
        &self.raw[OFFSET_REPORT_DATA..OFFSET_REPORT_DATA + REPORT_DATA_SIZE]
    }

    pub fn measurement(&self) -> &[u8] {
        &self.raw[OFFSET_MEASUREMENT..OFFSET_MEASUREMENT + MEASUREMENT_SIZE]
    }

    pub fn host_data(&self) -> &[u8] {
        &self.raw[OFFSET_HOST_DATA..OFFSET_HOST_DATA + 32]
    }

    pub fn id_key_digest(&self) -> &[u8] {
        &self.raw[OFFSET_ID_KEY_DIGEST..OFFSET_ID_KEY_DIGEST + 48]
    }

    pub fn author_key_digest(&self) -> &[u8] {
        &self.raw[OFFSET_AUTHOR_KEY_DIGEST..OFFSET_AUTHOR_KEY_DIGEST + 48]
    }

    pub fn report_id(&self) -> &[u8] {
        &self.raw[OFFSET_REPORT_ID..OFFSET_REPORT_ID + 32]
    }

    pub fn report_id_ma(&self) -> &[u8] {
        &self.raw[OFFSET_REPORT_ID_MA..OFFSET_REPORT_ID_MA + 32]
    }

    pub fn reported_tcb(&self) -> TcbVersion {
        TcbVersion::from_u64(self.u64_at(OFFSET_REPORTED_TCB))
    }

    pub fn chip_id(&self) -> &[u8] {
        &self.raw[OFFSET_CHIP_ID..OFFSET_CHIP_ID + CHIP_ID_SIZE]
    }

    pub fn committed_tcb(&self) -> TcbVersion {
        TcbVersion::from_u64(self.u64_at(OFFSET_COMMITTED_TCB))
    }

    pub fn current_build(&self) -> u8 {
        self.raw[OFFSET_CURRENT_BUILD]
    }

    pub fn current_minor(&self) -> u8 {
        self.raw[OFFSET_CURRENT_MINOR]
    }

    pub fn current_major(&self) -> u8 {
        self.raw[OFFSET_CURRENT_MAJOR]
    }

    pub fn committed_build(&self) -> u8 {
        self.raw[OFFSET_COMMITTED_BUILD]
    }

    pub fn committed_minor(&self) -> u8 {
        self.raw[OFFSET_COMMITTED_MINOR]
    }

    pub fn committed_major(&self) -> u8 {
        self.raw[OFFSET_COMMITTED_MAJOR]
    }

    pub fn launch_tcb(&self) -> TcbVersion {
        TcbVersion::from_u64(self.u64_at(OFFSET_LAUNCH_TCB))
    }

    pub fn signature(&self) -> &[u8] {
        &self.raw[OFFSET_SIGNATURE..OFFSET_SIGNATURE + SIGNATURE_SIZE]
    }

    /// The bytes covered by the report signature.
    pub fn signed_body(&self) -> &[u8] {
        &self.raw[..OFFSET_SIGNATURE]
    }

    /// Processor product line.
    ///
    /// Version 3 reports carry CPUID family/model; earlier versions omit
    /// them and are Genoa in this deployment.
    pub fn product_name(&self) -> &'static str {
        if self.version() >= 3 {
            let family = self.raw[OFFSET_CPUID_FAMILY];
            let model = self.raw[OFFSET_CPUID_MODEL];
            match (family, model) {
                (0x19, 0x00..=0x0F) => "Milan",
                (0x19, 0x10..=0x1F) => "Genoa",
                (0x1A, 0x00..=0x11) => "Turin",
                _ => "Unknown",
            }
        } else {
            "Genoa"
        }
    }

    /// Split the signature field into big-endian (r, s) scalars.
    ///
    /// AMD stores each component little-endian in a 72-byte slot; only the
    /// first 48 bytes of each slot carry the P-384 scalar.
    pub fn signature_scalars(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let sig = self.signature();

        let r_le = &sig[..SIG_VALUE_SIZE];
        let s_le = &sig[SIG_COMPONENT_SIZE..SIG_COMPONENT_SIZE + SIG_VALUE_SIZE];

        if r_le.iter().all(|&b| b == 0) || s_le.iter().all(|&b| b == 0) {
            return Err(Error::attestation("report signature component is all zeros"));
        }

        let r_be: Vec<u8> = r_le.iter().copied().rev().collect();
        let s_be: Vec<u8> = s_le.iter().copied().rev().collect();
        Ok((r_be, s_be))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a well-formed synthetic version-2 report.
    pub(crate) fn build_report() -> Vec<u8> {
        let mut raw = vec![0u8; REPORT_SIZE];
        raw[OFFSET_VERSION] = 2;

        // Policy: reserved1 + SMT allowed, ABI 0.31.
        let policy: u64 = (1 << POLICY_RESERVED1_BIT) | (1 << POLICY_SMT_BIT) | 31;
        raw[OFFSET_POLICY..OFFSET_POLICY + 8].copy_from_slice(&policy.to_le_bytes());

        // Signer info: VCEK, no masking.
        raw[OFFSET_SIGNER_INFO..OFFSET_SIGNER_INFO + 4].copy_from_slice(&0u32.to_le_bytes());

        // Signature algorithm: ECDSA P-384.
        raw[OFFSET_SIGNATURE_ALGO..OFFSET_SIGNATURE_ALGO + 4].copy_from_slice(&1u32.to_le_bytes());

        // Platform info: SMT + TSME.
        raw[OFFSET_PLATFORM_INFO..OFFSET_PLATFORM_INFO + 8].copy_from_slice(&3u64.to_le_bytes());

        let tcb = TcbVersion {
            bl_spl: 0x07,
            tee_spl: 0x00,
            snp_spl: 0x0e,
            ucode_spl: 0x48,
        }
        .as_u64();
        for offset in [
            OFFSET_CURRENT_TCB,
            OFFSET_REPORTED_TCB,
            OFFSET_COMMITTED_TCB,
            OFFSET_LAUNCH_TCB,
        ] {
            raw[offset..offset + 8].copy_from_slice(&tcb.to_le_bytes());
        }

        // Firmware 1.55 build 21, committed == current.
        raw[OFFSET_CURRENT_BUILD] = 21;
        raw[OFFSET_CURRENT_MINOR] = 55;
        raw[OFFSET_CURRENT_MAJOR] = 1;
        raw[OFFSET_COMMITTED_BUILD] = 21;
        raw[OFFSET_COMMITTED_MINOR] = 55;
        raw[OFFSET_COMMITTED_MAJOR] = 1;

        for (i, byte) in raw[OFFSET_MEASUREMENT..OFFSET_MEASUREMENT + MEASUREMENT_SIZE]
            .iter_mut()
            .enumerate()
        {
            *byte = i as u8;
        }
        for (i, byte) in raw[OFFSET_CHIP_ID..OFFSET_CHIP_ID + CHIP_ID_SIZE]
            .iter_mut()
            .enumerate()
        {
            *byte = 0xC0 ^ (i as u8);
        }
        for (i, byte) in raw[OFFSET_REPORT_DATA..OFFSET_REPORT_DATA + REPORT_DATA_SIZE]
            .iter_mut()
            .enumerate()
        {
            *byte = 0x80 | (i as u8);
        }

        // Non-zero signature scalars so structural checks pass.
        raw[OFFSET_SIGNATURE] = 1;
        raw[OFFSET_SIGNATURE + SIG_COMPONENT_SIZE] = 1;

        raw
    }

    pub(crate) fn set_policy(raw: &mut [u8], policy: u64) {
        raw[OFFSET_POLICY..OFFSET_POLICY + 8].copy_from_slice(&policy.to_le_bytes());
    }

    pub(crate) fn set_signer_info(raw: &mut [u8], info: u32) {
        raw[OFFSET_SIGNER_INFO..OFFSET_SIGNER_INFO + 4].copy_from_slice(&info.to_le_bytes());
    }

    pub(crate) fn set_current_tcb(raw: &mut [u8], tcb: TcbVersion) {
        raw[OFFSET_CURRENT_TCB..OFFSET_CURRENT_TCB + 8]
            .copy_from_slice(&tcb.as_u64().to_le_bytes());
    }

    pub(crate) fn set_current_build(raw: &mut [u8], build: u8) {
        raw[OFFSET_CURRENT_BUILD] = build;
    }

    pub(crate) fn set_vmpl(raw: &mut [u8], vmpl: u32) {
        raw[OFFSET_VMPL..OFFSET_VMPL + 4].copy_from_slice(&vmpl.to_le_bytes());
    }

    pub(crate) fn set_signature_scalars(raw: &mut [u8], r_be: &[u8], s_be: &[u8]) {
        let r_le: Vec<u8> = r_be.iter().copied().rev().collect();
        let s_le: Vec<u8> = s_be.iter().copied().rev().collect();
        raw[OFFSET_SIGNATURE..OFFSET_SIGNATURE + SIG_VALUE_SIZE].copy_from_slice(&r_le);
        raw[OFFSET_SIGNATURE + SIG_COMPONENT_SIZE
            ..OFFSET_SIGNATURE + SIG_COMPONENT_SIZE + SIG_VALUE_SIZE]
            .copy_from_slice(&s_le);
    }
}
