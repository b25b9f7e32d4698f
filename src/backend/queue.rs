// Queue multiplexing - logical roles onto physical queues
//
// Responsibilities:
// - Describe the queue families a physical device exposes
// - Reserve one queue for graphics+present and one for transfer
// - Hand out per-queue locks (aliased roles share the same lock)

use anyhow::Result;
use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

bitflags::bitflags! {
    /// Capabilities the renderer cares about, per queue family
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueueFlags: u8 {
        const GRAPHICS = 1 << 0;
        const PRESENT = 1 << 1;
        const TRANSFER = 1 << 2;
    }
}

/// Logical queue role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Present,
    Transfer,
}

impl QueueRole {
    pub const ALL: [QueueRole; 3] = [QueueRole::Graphics, QueueRole::Present, QueueRole::Transfer];

    pub fn flag(self) -> QueueFlags {
        match self {
            QueueRole::Graphics => QueueFlags::GRAPHICS,
            QueueRole::Present => QueueFlags::PRESENT,
            QueueRole::Transfer => QueueFlags::TRANSFER,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A queue family as seen by the selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFamily {
    pub family_index: u32,
    pub flags: QueueFlags,
    pub total: u32,
    pub reserved: u32,
}

impl QueueFamily {
    pub fn new(family_index: u32, flags: QueueFlags, total: u32) -> Self {
        Self { family_index, flags, total, reserved: 0 }
    }

    /// Read the queue families of a physical device, tagging present support
    pub fn enumerate(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<QueueFamily>> {
        let properties = unsafe {
            instance.get_physical_device_queue_family_properties(physical_device)
        };

        let mut families = Vec::with_capacity(properties.len());
        for (index, props) in properties.iter().enumerate() {
            let index = index as u32;
            let mut flags = QueueFlags::empty();
            if props.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                flags |= QueueFlags::GRAPHICS;
            }
            // Graphics and compute queues implicitly accept transfer commands
            if props.queue_flags.intersects(
                vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            ) {
                flags |= QueueFlags::TRANSFER;
            }
            let present = unsafe {
                surface_loader.get_physical_device_surface_support(physical_device, index, surface)
            }?;
            if present {
                flags |= QueueFlags::PRESENT;
            }
            if !flags.is_empty() && props.queue_count > 0 {
                families.push(QueueFamily::new(index, flags, props.queue_count));
            }
        }

        Ok(families)
    }

    fn available(&self) -> bool {
        self.reserved < self.total
    }
}

/// (family, queue) pair a role resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueId {
    pub family_index: u32,
    pub array_index: u32,
    /// False when another role submits to the same physical queue
    pub unique: bool,
}

impl QueueId {
    fn same_queue(&self, other: &QueueId) -> bool {
        self.family_index == other.family_index && self.array_index == other.array_index
    }
}

/// One `VkDeviceQueueCreateInfo` worth of data
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRequest {
    pub family_index: u32,
    pub priorities: Vec<f32>,
}

/// Result of queue reservation: what to create, and who gets what
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSelection {
    pub requests: Vec<QueueRequest>,
    /// Indexed by `QueueRole`
    pub assigned: [QueueId; 3],
}

impl QueueSelection {
    pub fn queue(&self, role: QueueRole) -> QueueId {
        self.assigned[role.index()]
    }
}

/// Queue layout override, for debugging role aliasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueSelect {
    #[default]
    Auto,
    /// Every role on the graphics+present family
    SingleFamily,
    /// Every role on one queue
    SingleQueue,
}

impl QueueSelect {
    /// Narrow the families `select` may choose from
    pub fn restrict(self, mut families: Vec<QueueFamily>) -> Vec<QueueFamily> {
        if self == QueueSelect::Auto {
            return families;
        }
        let required = QueueFlags::all();
        families.retain(|f| f.flags.contains(required));
        families.truncate(1);
        if self == QueueSelect::SingleQueue {
            for family in &mut families {
                family.total = 1;
            }
        }
        families
    }
}

struct Selector {
    families: Vec<QueueFamily>,
}

impl Selector {
    fn new(families: Vec<QueueFamily>) -> Self {
        let found = families.iter().fold(QueueFlags::empty(), |acc, f| acc | f.flags);
        if !found.contains(QueueFlags::all()) {
            log::error!(
                "Required Vulkan queues not present on selected physical device ({:?})",
                found
            );
        }
        Self { families }
    }

    /// Family whose flags equal `flags` exactly
    fn exact(&self, flags: QueueFlags) -> Option<usize> {
        self.families.iter().position(|f| f.flags == flags && f.available())
    }

    /// Any family supporting `flags`
    fn best(&self, flags: QueueFlags) -> Option<usize> {
        self.families.iter().position(|f| f.flags.contains(flags) && f.available())
    }

    fn reserve(&mut self, combo: &[QueueFlags]) -> Option<usize> {
        let found = combo
            .iter()
            .find_map(|&flags| self.exact(flags))
            .or_else(|| combo.iter().find_map(|&flags| self.best(flags)))?;
        self.families[found].reserved += 1;
        Some(found)
    }
}

/// Reserve queues for {graphics+present, transfer}.
///
/// Returns `None` when no family supports graphics and present together;
/// the renderer cannot be constructed in that case.
pub fn select(families: Vec<QueueFamily>) -> Option<QueueSelection> {
    let mut selector = Selector::new(families);

    let gp = selector.reserve(&[QueueFlags::GRAPHICS | QueueFlags::PRESENT]);
    let t = selector.reserve(&[
        QueueFlags::TRANSFER,
        QueueFlags::TRANSFER | QueueFlags::PRESENT,
        QueueFlags::TRANSFER | QueueFlags::GRAPHICS,
    ]);
    let gp = &selector.families[gp?];
    let t = t.map(|t| &selector.families[t]);

    let queue = |family: &QueueFamily, array_index: u32| QueueId {
        family_index: family.family_index,
        array_index,
        unique: false,
    };

    let (requests, graphics, transfer) = match t {
        Some(t) if t.family_index != gp.family_index => (
            // Two families, two queues
            vec![
                QueueRequest { family_index: gp.family_index, priorities: vec![1.0] },
                QueueRequest { family_index: t.family_index, priorities: vec![1.0] },
            ],
            queue(gp, 0),
            queue(t, 0),
        ),
        _ if gp.total > 1 => (
            // One family, two queues
            vec![QueueRequest { family_index: gp.family_index, priorities: vec![0.8, 0.2] }],
            queue(gp, 0),
            queue(gp, 1),
        ),
        _ => (
            // One family, one queue
            vec![QueueRequest { family_index: gp.family_index, priorities: vec![1.0] }],
            queue(gp, 0),
            queue(gp, 0),
        ),
    };

    let unique = !graphics.same_queue(&transfer);
    let graphics = QueueId { unique, ..graphics };
    let transfer = QueueId { unique, ..transfer };

    Some(QueueSelection { requests, assigned: [graphics, graphics, transfer] })
}

/// A resolved device queue
#[derive(Debug, Clone, Copy)]
pub struct Queue {
    pub queue: vk::Queue,
    pub id: QueueId,
    pub flags: QueueFlags,
}

/// Role table + submission locks.
///
/// Read-only after construction; roles resolving to the same physical
/// queue share a lock.
pub struct QueueMultiplex {
    queues: [Queue; 3],
    locks: [Arc<Mutex<()>>; 3],
    family_count: u32,
    queue_count: u32,
}

impl QueueMultiplex {
    /// Resolve a selection into device queues via `get_queue(family, index)`
    pub fn new(
        selection: &QueueSelection,
        families: &[QueueFamily],
        mut get_queue: impl FnMut(u32, u32) -> vk::Queue,
    ) -> Self {
        let resolve = |id: QueueId, get_queue: &mut dyn FnMut(u32, u32) -> vk::Queue| Queue {
            queue: get_queue(id.family_index, id.array_index),
            id,
            flags: families
                .iter()
                .find(|f| f.family_index == id.family_index)
                .map(|f| f.flags)
                .unwrap_or_default(),
        };
        let queues = QueueRole::ALL.map(|role| resolve(selection.queue(role), &mut get_queue));

        let mut locks: Vec<Arc<Mutex<()>>> = Vec::with_capacity(3);
        for (i, q) in queues.iter().enumerate() {
            let shared = queues[..i].iter().position(|other| other.id.same_queue(&q.id));
            let lock = match shared {
                Some(j) => locks[j].clone(),
                None => Arc::new(Mutex::new(())),
            };
            locks.push(lock);
        }
        let locks = [locks[0].clone(), locks[1].clone(), locks[2].clone()];

        let mut family_indices: Vec<u32> = queues.iter().map(|q| q.id.family_index).collect();
        family_indices.sort_unstable();
        family_indices.dedup();
        let mut pairs: Vec<(u32, u32)> =
            queues.iter().map(|q| (q.id.family_index, q.id.array_index)).collect();
        pairs.sort_unstable();
        pairs.dedup();

        let multiplex = Self {
            queues,
            locks,
            family_count: family_indices.len() as u32,
            queue_count: pairs.len() as u32,
        };
        log::debug!(
            "Multiplexing {} Vulkan queue(s) from {} families [Graphics/Present, Transfer]",
            multiplex.queue_count,
            multiplex.family_count
        );
        multiplex
    }

    pub fn queue(&self, role: QueueRole) -> &Queue {
        &self.queues[role.index()]
    }

    /// Lock guarding submissions to the queue backing `role`
    pub fn lock(&self, role: QueueRole) -> MutexGuard<'_, ()> {
        self.locks[role.index()].lock()
    }

    /// True if both roles serialize on the same lock
    pub fn shares_lock(&self, a: QueueRole, b: QueueRole) -> bool {
        Arc::ptr_eq(&self.locks[a.index()], &self.locks[b.index()])
    }

    /// Distinct family indices used by the roles in `flags`
    pub fn family_indices(&self, flags: QueueFlags) -> Vec<u32> {
        let graphics = self.queue(QueueRole::Graphics).id.family_index;
        let mut ret = Vec::with_capacity(3);
        if flags.contains(QueueFlags::GRAPHICS) {
            ret.push(graphics);
        }
        for role in [QueueRole::Present, QueueRole::Transfer] {
            let family = self.queue(role).id.family_index;
            if flags.contains(role.flag()) && family != graphics && !ret.contains(&family) {
                ret.push(family);
            }
        }
        ret
    }

    /// EXCLUSIVE when only one family touches the resource, else `desired`
    pub fn sharing_mode(&self, flags: QueueFlags, desired: vk::SharingMode) -> vk::SharingMode {
        if self.family_indices(flags).len() == 1 {
            vk::SharingMode::EXCLUSIVE
        } else {
            desired
        }
    }

    pub fn family_count(&self) -> u32 {
        self.family_count
    }

    pub fn queue_count(&self) -> u32 {
        self.queue_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const ALL: QueueFlags = QueueFlags::all();

    fn fake_queue(family: u32, index: u32) -> vk::Queue {
        vk::Queue::from_raw(((family as u64) << 8 | index as u64) + 1)
    }

    #[test]
    fn single_family_single_queue_aliases_all_roles() {
        let selection = select(vec![QueueFamily::new(0, ALL, 1)]).unwrap();

        assert_eq!(
            selection.requests,
            vec![QueueRequest { family_index: 0, priorities: vec![1.0] }]
        );
        let g = selection.queue(QueueRole::Graphics);
        let t = selection.queue(QueueRole::Transfer);
        assert_eq!((g.family_index, g.array_index), (t.family_index, t.array_index));
        assert!(!g.unique);
        assert!(!t.unique);
    }

    #[test]
    fn disjoint_families_get_unique_queues() {
        let families = vec![
            QueueFamily::new(0, QueueFlags::GRAPHICS | QueueFlags::PRESENT, 1),
            QueueFamily::new(1, QueueFlags::TRANSFER, 1),
        ];
        let selection = select(families).unwrap();

        let g = selection.queue(QueueRole::Graphics);
        let p = selection.queue(QueueRole::Present);
        let t = selection.queue(QueueRole::Transfer);
        assert_eq!((g.family_index, g.array_index), (0, 0));
        assert_eq!(g, p);
        assert_eq!((t.family_index, t.array_index), (1, 0));
        assert!(g.unique && t.unique);
        assert_eq!(selection.requests.len(), 2);
    }

    #[test]
    fn exact_transfer_family_preferred_over_superset() {
        let families = vec![
            QueueFamily::new(0, ALL, 4),
            QueueFamily::new(1, QueueFlags::TRANSFER | QueueFlags::GRAPHICS, 2),
            QueueFamily::new(2, QueueFlags::TRANSFER, 2),
        ];
        let selection = select(families).unwrap();

        assert_eq!(selection.queue(QueueRole::Graphics).family_index, 0);
        assert_eq!(selection.queue(QueueRole::Transfer).family_index, 2);
    }

    #[test]
    fn one_family_with_two_queues_splits_transfer() {
        let selection = select(vec![QueueFamily::new(0, ALL, 2)]).unwrap();

        assert_eq!(
            selection.requests,
            vec![QueueRequest { family_index: 0, priorities: vec![0.8, 0.2] }]
        );
        let t = selection.queue(QueueRole::Transfer);
        assert_eq!((t.family_index, t.array_index), (0, 1));
        assert!(t.unique);
    }

    #[test]
    fn missing_graphics_present_yields_nothing() {
        let families = vec![
            QueueFamily::new(0, QueueFlags::GRAPHICS | QueueFlags::TRANSFER, 1),
            QueueFamily::new(1, QueueFlags::TRANSFER, 1),
        ];
        assert!(select(families).is_none());
    }

    #[test]
    fn forced_layouts_collapse_roles() {
        let families = vec![
            QueueFamily::new(0, ALL, 4),
            QueueFamily::new(1, QueueFlags::TRANSFER, 2),
        ];

        let auto = select(QueueSelect::Auto.restrict(families.clone())).unwrap();
        assert_eq!(auto.queue(QueueRole::Transfer).family_index, 1);

        let family = select(QueueSelect::SingleFamily.restrict(families.clone())).unwrap();
        let t = family.queue(QueueRole::Transfer);
        assert_eq!((t.family_index, t.array_index), (0, 1));
        assert!(t.unique);

        let queue = select(QueueSelect::SingleQueue.restrict(families)).unwrap();
        assert!(!queue.queue(QueueRole::Transfer).unique);
        assert_eq!(queue.requests, vec![QueueRequest { family_index: 0, priorities: vec![1.0] }]);
    }

    #[test]
    fn aliased_roles_share_a_lock() {
        let families = vec![QueueFamily::new(0, ALL, 1)];
        let selection = select(families.clone()).unwrap();
        let queues = QueueMultiplex::new(&selection, &families, fake_queue);

        assert!(queues.shares_lock(QueueRole::Graphics, QueueRole::Transfer));
        assert_eq!(queues.queue_count(), 1);
        assert_eq!(queues.family_indices(ALL), vec![0]);
        assert_eq!(
            queues.sharing_mode(ALL, vk::SharingMode::CONCURRENT),
            vk::SharingMode::EXCLUSIVE
        );
    }

    #[test]
    fn disjoint_roles_use_separate_locks() {
        let families = vec![
            QueueFamily::new(3, QueueFlags::GRAPHICS | QueueFlags::PRESENT, 1),
            QueueFamily::new(5, QueueFlags::TRANSFER, 1),
        ];
        let selection = select(families.clone()).unwrap();
        let queues = QueueMultiplex::new(&selection, &families, fake_queue);

        assert!(queues.shares_lock(QueueRole::Graphics, QueueRole::Present));
        assert!(!queues.shares_lock(QueueRole::Graphics, QueueRole::Transfer));
        assert_eq!(queues.family_count(), 2);
        assert_eq!(queues.family_indices(QueueFlags::GRAPHICS | QueueFlags::TRANSFER), vec![3, 5]);
        assert_eq!(queues.family_indices(QueueFlags::GRAPHICS), vec![3]);
        let both = QueueFlags::GRAPHICS | QueueFlags::TRANSFER;
        assert_eq!(
            queues.sharing_mode(both, vk::SharingMode::CONCURRENT),
            vk::SharingMode::CONCURRENT
        );
        assert_eq!(queues.queue(QueueRole::Transfer).queue, fake_queue(5, 0));
    }
}
