//! Flag bitmaps carried inside spawn messages
//!
//! Both the message-flag record and the permission record use the same
//! layout: a word count followed by that many 32-bit words, bit `i` living in
//! word `i / 32` at position `i % 32`.

use std::fmt;

const WORD_BITS: usize = 32;

/// Variable-width bitmap of flag indices
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FlagBitmap {
    words: Vec<u32>,
}

impl FlagBitmap {
    /// Empty bitmap with room for `bits` flags
    pub fn with_capacity(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(WORD_BITS)],
        }
    }

    /// Bitmap backed by the given raw words
    pub fn from_words(words: Vec<u32>) -> Self {
        Self { words }
    }

    /// Bitmap holding the low 64 bits given
    pub fn from_u64(bits: u64) -> Self {
        Self {
            words: vec![bits as u32, (bits >> 32) as u32],
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Number of addressable bits
    pub fn capacity(&self) -> usize {
        self.words.len() * WORD_BITS
    }

    /// Set bit `index`, growing the bitmap if needed
    pub fn set(&mut self, index: usize) {
        let word = index / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % WORD_BITS);
    }

    pub fn clear(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / WORD_BITS) {
            *word &= !(1 << (index % WORD_BITS));
        }
    }

    /// Whether bit `index` is set; bits beyond the capacity read as unset
    pub fn is_set(&self, index: usize) -> bool {
        self.words
            .get(index / WORD_BITS)
            .is_some_and(|word| word & (1 << (index % WORD_BITS)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Low 64 bits as an integer
    pub fn to_u64(&self) -> u64 {
        let lo = self.words.first().copied().unwrap_or(0) as u64;
        let hi = self.words.get(1).copied().unwrap_or(0) as u64;
        lo | (hi << 32)
    }

    /// Indices of all set bits, ascending
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity()).filter(|i| self.is_set(*i))
    }
}

impl fmt::Display for FlagBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, word) in self.words.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:#010x}", word)?;
        }
        write!(f, "]")
    }
}

/// Per-request application flags (indices into the message-flag bitmap)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AppFlag {
    ColdBoot = 0,
    BackupExtension = 1,
    DlpManager = 2,
    Debuggable = 3,
    AsanEnabled = 4,
    AccessBundleDir = 5,
    NativeDebug = 6,
    NoSandbox = 7,
    Overlay = 8,
    BundleResources = 9,
    GwpEnabledForce = 10,
    GwpEnabledNormal = 11,
    TsanEnabled = 12,
    IgnoreSandbox = 13,
    IsolatedSandbox = 14,
    ExtensionSandbox = 15,
    CloneEnable = 16,
    DeveloperMode = 17,
    BegetctlBoot = 18,
    AtomicService = 19,
}

impl AppFlag {
    pub const ALL: [AppFlag; 20] = [
        AppFlag::ColdBoot,
        AppFlag::BackupExtension,
        AppFlag::DlpManager,
        AppFlag::Debuggable,
        AppFlag::AsanEnabled,
        AppFlag::AccessBundleDir,
        AppFlag::NativeDebug,
        AppFlag::NoSandbox,
        AppFlag::Overlay,
        AppFlag::BundleResources,
        AppFlag::GwpEnabledForce,
        AppFlag::GwpEnabledNormal,
        AppFlag::TsanEnabled,
        AppFlag::IgnoreSandbox,
        AppFlag::IsolatedSandbox,
        AppFlag::ExtensionSandbox,
        AppFlag::CloneEnable,
        AppFlag::DeveloperMode,
        AppFlag::BegetctlBoot,
        AppFlag::AtomicService,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Parse a kebab-case flag name (as used on the command line)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|flag| flag.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            AppFlag::ColdBoot => "cold-boot",
            AppFlag::BackupExtension => "backup-extension",
            AppFlag::DlpManager => "dlp-manager",
            AppFlag::Debuggable => "debuggable",
            AppFlag::AsanEnabled => "asan",
            AppFlag::AccessBundleDir => "access-bundle-dir",
            AppFlag::NativeDebug => "native-debug",
            AppFlag::NoSandbox => "no-sandbox",
            AppFlag::Overlay => "overlay",
            AppFlag::BundleResources => "bundle-resources",
            AppFlag::GwpEnabledForce => "gwp-force",
            AppFlag::GwpEnabledNormal => "gwp-normal",
            AppFlag::TsanEnabled => "tsan",
            AppFlag::IgnoreSandbox => "ignore-sandbox",
            AppFlag::IsolatedSandbox => "isolated-sandbox",
            AppFlag::ExtensionSandbox => "extension-sandbox",
            AppFlag::CloneEnable => "clone-enable",
            AppFlag::DeveloperMode => "developer-mode",
            AppFlag::BegetctlBoot => "begetctl-boot",
            AppFlag::AtomicService => "atomic-service",
        }
    }
}
