//! VNI and overlay address allocation

use std::collections::HashSet;
use std::net::Ipv4Addr;

use rand::Rng;
use tracing::debug;
use vxtun_common::{TunnelError, TunnelResult};

use crate::types::{overlay_network, validate_vni, Tunnel, OVERLAY_POOL, OVERLAY_PREFIX_LEN};

/// Default lower bound of the sampled VNI range
pub const DEFAULT_VNI_RANGE_START: u32 = 10_000;

/// Default upper bound of the sampled VNI range
pub const DEFAULT_VNI_RANGE_END: u32 = 99_999;

/// Random draws before falling back to a linear scan
pub const DEFAULT_RANDOM_ATTEMPTS: u32 = 100;

/// Number of overlay blocks in the /16 pool
pub const OVERLAY_BLOCKS: u32 = 1 << (OVERLAY_PREFIX_LEN as u32 - 16);

/// Overlay block index for a VNI
pub fn overlay_block(vni: u32) -> u32 {
    vni % OVERLAY_BLOCKS
}

/// Derive the `(relay, origin)` overlay address pair for a VNI
///
/// The relay takes the first host address of the block and the origin the
/// second. A /30 block never straddles a /24, so both share one /24 prefix.
pub fn derive_overlay_pair(vni: u32) -> (Ipv4Addr, Ipv4Addr) {
    let base = u32::from(OVERLAY_POOL) + overlay_block(vni) * 4;
    (Ipv4Addr::from(base + 1), Ipv4Addr::from(base + 2))
}

/// A VNI together with its derived overlay pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub vni: u32,
    pub relay_overlay_address: Ipv4Addr,
    pub origin_overlay_address: Ipv4Addr,
}

impl Allocation {
    pub fn for_vni(vni: u32) -> Self {
        let (relay, origin) = derive_overlay_pair(vni);
        Self {
            vni,
            relay_overlay_address: relay,
            origin_overlay_address: origin,
        }
    }
}

/// Picks unused VNIs from a bounded range
#[derive(Debug, Clone)]
pub struct Allocator {
    range_start: u32,
    range_end: u32,
    random_attempts: u32,
}

impl Default for Allocator {
    fn default() -> Self {
        Self {
            range_start: DEFAULT_VNI_RANGE_START,
            range_end: DEFAULT_VNI_RANGE_END,
            random_attempts: DEFAULT_RANDOM_ATTEMPTS,
        }
    }
}

impl Allocator {
    pub fn new(range_start: u32, range_end: u32, random_attempts: u32) -> TunnelResult<Self> {
        validate_vni(range_start)?;
        validate_vni(range_end)?;
        if range_start > range_end {
            return Err(TunnelError::validation(
                "vni_range",
                format!("start {} is above end {}", range_start, range_end),
            ));
        }
        Ok(Self {
            range_start,
            range_end,
            random_attempts,
        })
    }

    fn range_label(&self) -> String {
        format!("{}..={}", self.range_start, self.range_end)
    }

    /// Pick a VNI not used by any of `existing`
    pub fn allocate_id<'a>(
        &self,
        existing: impl IntoIterator<Item = &'a Tunnel>,
    ) -> TunnelResult<u32> {
        self.allocate_id_with(existing, &mut rand::thread_rng())
    }

    /// [`Allocator::allocate_id`] with a caller-supplied random source
    pub fn allocate_id_with<'a, R: Rng>(
        &self,
        existing: impl IntoIterator<Item = &'a Tunnel>,
        rng: &mut R,
    ) -> TunnelResult<u32> {
        // Stored overlays may not follow the VNI derivation (manual origins),
        // so occupied subnets come from the records themselves.
        let mut used_vnis = HashSet::new();
        let mut used_subnets = HashSet::new();
        for tunnel in existing {
            used_vnis.insert(tunnel.vni);
            used_subnets.insert(tunnel.overlay_network());
        }

        let is_free = |vni: u32| {
            let (relay, _) = derive_overlay_pair(vni);
            !used_vnis.contains(&vni) && !used_subnets.contains(&overlay_network(relay))
        };

        for _ in 0..self.random_attempts {
            let candidate = rng.gen_range(self.range_start..=self.range_end);
            if is_free(candidate) {
                return Ok(candidate);
            }
        }

        debug!(
            attempts = self.random_attempts,
            range = %self.range_label(),
            "Random VNI sampling exhausted, scanning linearly"
        );

        (self.range_start..=self.range_end)
            .find(|vni| is_free(*vni))
            .ok_or_else(|| TunnelError::exhausted("VNI", self.range_label()))
    }

    /// Pick a VNI and derive its overlay pair
    pub fn allocate<'a>(
        &self,
        existing: impl IntoIterator<Item = &'a Tunnel>,
    ) -> TunnelResult<Allocation> {
        self.allocate_id(existing).map(Allocation::for_vni)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::{origin_tunnel, relay_tunnel};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_overlay_pair_is_deterministic() {
        assert_eq!(derive_overlay_pair(12345), derive_overlay_pair(12345));
        assert_eq!(
            derive_overlay_pair(0),
            (Ipv4Addr::new(10, 100, 0, 1), Ipv4Addr::new(10, 100, 0, 2))
        );
        assert_eq!(
            derive_overlay_pair(OVERLAY_BLOCKS - 1),
            (Ipv4Addr::new(10, 100, 255, 253), Ipv4Addr::new(10, 100, 255, 254))
        );
    }

    #[test]
    fn test_overlay_pair_shares_subnet_and_slash24() {
        for vni in [1, 10000, 54321, 99999, 16_777_215] {
            let (relay, origin) = derive_overlay_pair(vni);
            assert_ne!(relay, origin);
            assert_eq!(overlay_network(relay), overlay_network(origin));
            assert_eq!(relay.octets()[..3], origin.octets()[..3]);
        }
    }

    #[test]
    fn test_allocate_within_range() {
        let allocator = Allocator::default();
        let vni = allocator.allocate_id(&[]).unwrap();
        assert!((DEFAULT_VNI_RANGE_START..=DEFAULT_VNI_RANGE_END).contains(&vni));
    }

    #[test]
    fn test_allocate_avoids_used_vni_and_block() {
        let allocator = Allocator::new(100, 102, 0).unwrap();
        let existing = vec![relay_tunnel("a", 100)];

        // Linear scan only: 100 is taken, 101 is the first free value
        assert_eq!(allocator.allocate_id(&existing).unwrap(), 101);

        // A VNI congruent to a used one collides on its overlay block
        let existing = vec![relay_tunnel("a", 100 + OVERLAY_BLOCKS)];
        assert_eq!(allocator.allocate_id(&existing).unwrap(), 101);
    }

    #[test]
    fn test_allocate_skips_subnet_held_by_manual_overlay() {
        let allocator = Allocator::new(10000, 10001, 0).unwrap();

        // Manual origin on VNI 50000 holding the block derived for 10000
        let mut manual = origin_tunnel("o", 50000);
        let (relay, origin) = derive_overlay_pair(10000);
        manual.relay_overlay_address = relay;
        manual.origin_overlay_address = origin;

        assert_eq!(allocator.allocate_id(&[manual.clone()]).unwrap(), 10001);

        // Block of 50000 is free again since the record does not occupy it
        let allocator = Allocator::new(50000 + OVERLAY_BLOCKS, 50000 + OVERLAY_BLOCKS, 0).unwrap();
        assert_eq!(
            allocator.allocate_id(&[manual]).unwrap(),
            50000 + OVERLAY_BLOCKS
        );
    }

    #[test]
    fn test_random_sampling_with_seeded_rng() {
        let allocator = Allocator::default();
        let mut rng = StdRng::seed_from_u64(7);
        let first = allocator.allocate_id_with(&[], &mut rng).unwrap();

        let existing = vec![relay_tunnel("a", first)];
        let second = allocator.allocate_id_with(&existing, &mut rng).unwrap();
        assert_ne!(first, second);
        assert_ne!(overlay_block(first), overlay_block(second));
    }

    #[test]
    fn test_exhaustion() {
        let allocator = Allocator::new(10, 12, 5).unwrap();
        let existing: Vec<_> = (10..=12)
            .map(|vni| relay_tunnel(&vni.to_string(), vni))
            .collect();

        match allocator.allocate_id(&existing) {
            Err(TunnelError::ResourceExhausted { resource, range }) => {
                assert_eq!(resource, "VNI");
                assert_eq!(range, "10..=12");
            }
            other => panic!("Expected ResourceExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_range() {
        assert!(Allocator::new(0, 10, 1).is_err());
        assert!(Allocator::new(20, 10, 1).is_err());
        assert!(Allocator::new(1, 16_777_216, 1).is_err());
    }

    #[test]
    fn test_allocation_for_vni() {
        let allocation = Allocation::for_vni(10001);
        assert_eq!(allocation.vni, 10001);
        assert_eq!(
            (allocation.relay_overlay_address, allocation.origin_overlay_address),
            derive_overlay_pair(10001)
        );
    }
}
