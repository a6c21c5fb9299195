//! Virtual network interfaces.

use crate::addr::IpNet;
use crate::error::{Error, Result};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Interface flag bitset, mirroring the usual NIC flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceFlags(u32);

impl InterfaceFlags {
    pub const UP: InterfaceFlags = InterfaceFlags(1 << 0);
    pub const LOOPBACK: InterfaceFlags = InterfaceFlags(1 << 1);
    pub const MULTICAST: InterfaceFlags = InterfaceFlags(1 << 2);
    pub const BROADCAST: InterfaceFlags = InterfaceFlags(1 << 3);
    pub const POINT_TO_POINT: InterfaceFlags = InterfaceFlags(1 << 4);

    pub fn contains(self, other: InterfaceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for InterfaceFlags {
    type Output = InterfaceFlags;

    fn bitor(self, rhs: InterfaceFlags) -> InterfaceFlags {
        InterfaceFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for InterfaceFlags {
    fn bitor_assign(&mut self, rhs: InterfaceFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for InterfaceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(InterfaceFlags, &str); 5] = [
            (InterfaceFlags::UP, "up"),
            (InterfaceFlags::LOOPBACK, "loopback"),
            (InterfaceFlags::MULTICAST, "multicast"),
            (InterfaceFlags::BROADCAST, "broadcast"),
            (InterfaceFlags::POINT_TO_POINT, "pointtopoint"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "0")?;
        }
        Ok(())
    }
}

/// A 6-byte MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareAddr([u8; 6]);

impl HardwareAddr {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// A random locally-administered unicast MAC.
    pub(crate) fn generate() -> Self {
        let mut octets: [u8; 6] = rand::random();
        octets[0] = (octets[0] | 0x02) & 0xfe;
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// A named virtual NIC with its assigned addresses.
#[derive(Debug, Clone)]
pub struct Interface {
    name: String,
    index: u32,
    mtu: u32,
    hardware_addr: Option<HardwareAddr>,
    flags: InterfaceFlags,
    addrs: Vec<IpNet>,
}

impl Interface {
    pub fn new(
        name: impl Into<String>,
        index: u32,
        mtu: u32,
        hardware_addr: Option<HardwareAddr>,
        flags: InterfaceFlags,
    ) -> Self {
        Self {
            name: name.into(),
            index,
            mtu,
            hardware_addr,
            flags,
            addrs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn hardware_addr(&self) -> Option<HardwareAddr> {
        self.hardware_addr
    }

    pub fn flags(&self) -> InterfaceFlags {
        self.flags
    }

    /// The assigned addresses, in assignment order. Fails while the interface
    /// has no address (an `eth0` that was never attached to a router).
    pub fn addrs(&self) -> Result<&[IpNet]> {
        if self.addrs.is_empty() {
            return Err(Error::NoAddressAssigned(self.name.clone()));
        }
        Ok(&self.addrs)
    }

    pub fn add_addr(&mut self, addr: IpNet) {
        self.addrs.push(addr);
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (index {}, mtu {}, {})", self.name, self.index, self.mtu, self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = InterfaceFlags::UP | InterfaceFlags::LOOPBACK | InterfaceFlags::MULTICAST;
        assert!(flags.contains(InterfaceFlags::UP));
        assert!(flags.contains(InterfaceFlags::UP | InterfaceFlags::LOOPBACK));
        assert!(!flags.contains(InterfaceFlags::BROADCAST));
        assert_eq!(flags.to_string(), "up|loopback|multicast");
        assert_eq!(InterfaceFlags::default().to_string(), "0");
    }

    #[test]
    fn test_generated_mac_is_local_unicast() {
        for _ in 0..32 {
            let mac = HardwareAddr::generate();
            let first = mac.octets()[0];
            assert_eq!(first & 0x02, 0x02, "locally administered bit");
            assert_eq!(first & 0x01, 0x00, "unicast bit");
        }
    }

    #[test]
    fn test_mac_display() {
        let mac = HardwareAddr::new([0x02, 0xab, 0x00, 0x01, 0x02, 0x03]);
        assert_eq!(mac.to_string(), "02:ab:00:01:02:03");
    }

    #[test]
    fn test_addrs_fails_until_assigned() {
        let mut ifc = Interface::new("eth0", 2, 1500, Some(HardwareAddr::generate()), InterfaceFlags::UP);
        assert!(matches!(ifc.addrs(), Err(Error::NoAddressAssigned(_))));

        ifc.add_addr("10.1.2.3/24".parse().unwrap());
        let addrs = ifc.addrs().unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].to_string(), "10.1.2.3/24");
    }
}
