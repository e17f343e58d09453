#![allow(dead_code)]

use kernel_memory_addresses::PageFrame;
use kernel_phys::{AllocRequest, BitmapPhysAlloc, DomainId, PhysAllocator, PhysSegment};
use kernel_reserv::{
    AnonymousGrows, ArrayMode, ObjectPage, ReservConfig, ReservError, ReservManager, VmObject,
};
use std::sync::Arc;

pub const MB: u64 = 1 << 20;
pub const D0: DomainId = DomainId::new(0);

pub struct Fixture {
    pub m: ReservManager,
    pub phys: Arc<BitmapPhysAlloc>,
}

impl Fixture {
    pub fn new(config: ReservConfig, segments: &[PhysSegment]) -> Self {
        let phys = Arc::new(BitmapPhysAlloc::new(segments).unwrap());
        Self::with_phys(config, segments, phys)
    }

    pub fn with_phys(
        config: ReservConfig,
        segments: &[PhysSegment],
        phys: Arc<BitmapPhysAlloc>,
    ) -> Self {
        let m = ReservManager::new(
            config,
            segments,
            ArrayMode::Dense,
            phys.clone(),
            Box::new(AnonymousGrows),
        )
        .unwrap();
        Self { m, phys }
    }

    /// Default levels over `[2 MiB, 2 MiB + mb MiB)`.
    pub fn default_mb(mb: u64) -> Self {
        Self::new(
            ReservConfig::default(),
            &[PhysSegment::new(2 * MB, (2 + mb) * MB, D0)],
        )
    }

    /// Allocates `pindex` of `object` and records the page in the object.
    pub fn page(&self, object: &Arc<VmObject>, pindex: u64) -> Result<PageFrame, ReservError> {
        let mpred = object.predecessor(pindex);
        let frame = self
            .m
            .alloc_page(object, pindex, D0, AllocRequest::normal(), mpred)?;
        assert!(object.insert_page(pindex, frame));
        Ok(frame)
    }

    /// Frees `pindex` of `object`, through its reservation if it has one.
    pub fn free(&self, object: &VmObject, pindex: u64) {
        let frame = object.remove_page(pindex).unwrap();
        free_frame(&self.m, self.phys.as_ref(), frame);
    }

    /// Frees every page of `object`.
    pub fn free_object(&self, object: &VmObject) {
        for ObjectPage { pindex, .. } in object.pages() {
            self.free(object, pindex);
        }
    }

    pub fn psind(&self, frame: PageFrame) -> u8 {
        self.phys.page_array().get(frame).unwrap().psind()
    }
}

/// What the page layer does with a page it no longer needs.
pub fn free_frame(m: &ReservManager, phys: &dyn PhysAllocator, frame: PageFrame) {
    if !m.free_page(frame) {
        phys.free_contig(frame, 1);
        phys.release_budget(D0, 1);
    }
}
