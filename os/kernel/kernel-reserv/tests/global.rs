mod common;

use common::{D0, MB};
use kernel_phys::{BitmapPhysAlloc, PhysSegment};
use kernel_reserv::{AnonymousGrows, ArrayMode, ReservConfig, ReservManager, StartupError};
use std::sync::Arc;

fn build() -> ReservManager {
    let segments = [PhysSegment::new(2 * MB, 6 * MB, D0)];
    let phys = Arc::new(BitmapPhysAlloc::new(&segments).unwrap());
    ReservManager::new(
        ReservConfig::default(),
        &segments,
        ArrayMode::Sparse,
        phys,
        Box::new(AnonymousGrows),
    )
    .unwrap()
}

#[test]
fn manager_installs_once() {
    assert!(ReservManager::global().is_none());
    let installed = build().install().unwrap();
    assert!(std::ptr::eq(installed, ReservManager::global().unwrap()));
    assert_eq!(build().install().unwrap_err(), StartupError::AlreadyInstalled);
    assert_eq!(installed.size(1), 2 * MB);
}
