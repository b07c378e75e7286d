// src/core/ft/listener.rs

/// Receives role changes for one membership.
///
/// `on_backup` is called once, on the caller's task, before `start` binds.
/// Every later call comes from the flow's dispatch task, in broker order.
/// Backup-to-Backup and Active-to-Active repeats are forwarded as they arrive.
pub trait FtEventListener: Send + Sync {
    fn on_active(&self);
    fn on_backup(&self);
}

/// Adapts a pair of closures into an [`FtEventListener`].
pub struct FnListener<A, B> {
    on_active: A,
    on_backup: B,
}

impl<A, B> FnListener<A, B>
where
    A: Fn() + Send + Sync,
    B: Fn() + Send + Sync,
{
    pub fn new(on_active: A, on_backup: B) -> Self {
        Self {
            on_active,
            on_backup,
        }
    }
}

impl<A, B> FtEventListener for FnListener<A, B>
where
    A: Fn() + Send + Sync,
    B: Fn() + Send + Sync,
{
    fn on_active(&self) {
        (self.on_active)()
    }

    fn on_backup(&self) {
        (self.on_backup)()
    }
}
