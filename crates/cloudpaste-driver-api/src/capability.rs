use serde::{Deserialize, Serialize};

/// A named bundle of driver methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Reader,
    Writer,
    DirectLink,
    Proxy,
    Multipart,
    Atomic,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Reader,
        Capability::Writer,
        Capability::DirectLink,
        Capability::Proxy,
        Capability::Multipart,
        Capability::Atomic,
    ];

    fn bit(self) -> u32 {
        match self {
            Capability::Reader => 1 << 0,
            Capability::Writer => 1 << 1,
            Capability::DirectLink => 1 << 2,
            Capability::Proxy => 1 << 3,
            Capability::Multipart => 1 << 4,
            Capability::Atomic => 1 << 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Reader => "READER",
            Capability::Writer => "WRITER",
            Capability::DirectLink => "DIRECT_LINK",
            Capability::Proxy => "PROXY",
            Capability::Multipart => "MULTIPART",
            Capability::Atomic => "ATOMIC",
        }
    }

    /// Name of the method group this capability guards; used in
    /// `not_implemented` errors.
    pub fn method_group(&self) -> &'static str {
        match self {
            Capability::Reader => "read operations",
            Capability::Writer => "write operations",
            Capability::DirectLink => "presigned links",
            Capability::Proxy => "proxy links",
            Capability::Multipart => "multipart uploads",
            Capability::Atomic => "atomic rename/copy",
        }
    }
}

/// Compact capability bitmask cached on each driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    pub const EMPTY: CapabilitySet = CapabilitySet(0);

    pub fn of(caps: &[Capability]) -> Self {
        let mut set = 0;
        for cap in caps {
            set |= cap.bit();
        }
        CapabilitySet(set)
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn is_subset_of(&self, other: CapabilitySet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn with(mut self, cap: Capability) -> Self {
        self.0 |= cap.bit();
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl std::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for cap in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(cap.as_str())?;
            first = false;
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}
