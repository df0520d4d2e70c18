//! Status tracking.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed},
    Mutex,
};

#[derive(Default)]
pub struct Status {
    pub profiles: Profiles,
    pub(crate) cancel: Cancel,
}

#[derive(Default)]
pub struct Profiles {
    converting: AtomicUsize,
    complete: AtomicUsize,
    failed: AtomicUsize,
    total: AtomicUsize,
}

#[derive(Default)]
pub(crate) struct Cancel {
    cancelled: AtomicBool,
    on_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Status {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Cancel execution.
    pub fn cancel(&self) {
        self.cancel.cancelled.store(true, Relaxed);
        if let Ok(mut guard) = self.cancel.on_cancel.lock() {
            if let Some(f) = guard.take() {
                f();
            }
        }
    }

    /// Return whether execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Profiles {
    /// Count a profile as converting until the returned guard is dropped.
    ///
    /// The guard also covers tasks aborted on cancellation, which never run to completion.
    pub(crate) fn converting(&self) -> Converting<'_> {
        self.converting.fetch_add(1, Relaxed);
        Converting(self)
    }

    pub fn converting_count(&self) -> usize {
        self.converting.load(Relaxed)
    }

    /// Count a finished profile, successful or not.
    pub(crate) fn inc_complete(&self) {
        self.complete.fetch_add(1, Relaxed);
    }

    pub fn complete_count(&self) -> usize {
        self.complete.load(Relaxed)
    }

    pub(crate) fn inc_failed(&self) {
        self.failed.fetch_add(1, Relaxed);
    }

    pub fn failed_count(&self) -> usize {
        self.failed.load(Relaxed)
    }

    pub(crate) fn set_total(&self, val: usize) {
        self.total.store(val, Relaxed)
    }

    pub fn total_count(&self) -> usize {
        self.total.load(Relaxed)
    }

    pub fn done(&self) -> bool {
        self.complete_count() == self.total_count()
    }
}

pub(crate) struct Converting<'a>(&'a Profiles);

impl Drop for Converting<'_> {
    fn drop(&mut self) {
        self.0.converting.fetch_sub(1, Relaxed);
    }
}

impl Cancel {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Relaxed)
    }

    pub fn on_cancel<F: FnOnce() + Send + 'static>(&self, f: F) {
        if let Ok(mut guard) = self.on_cancel.lock() {
            if self.is_cancelled() {
                drop(guard);
                f();
            } else {
                *guard = Some(Box::new(f));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn cancel_runs_the_registered_callback_once() {
        let status = Status::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        status.cancel.on_cancel(move || {
            counted.fetch_add(1, Relaxed);
        });
        status.cancel();
        status.cancel();
        assert!(status.is_cancelled());
        assert_eq!(calls.load(Relaxed), 1);
    }

    #[test]
    fn callback_registered_after_cancel_runs_immediately() {
        let status = Status::new();
        status.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        status.cancel.on_cancel(move || flag.store(true, Relaxed));
        assert!(ran.load(Relaxed));
    }

    #[test]
    fn converting_count_follows_the_guard() {
        let status = Status::new();
        let first = status.profiles.converting();
        let second = status.profiles.converting();
        assert_eq!(status.profiles.converting_count(), 2);
        drop(first);
        assert_eq!(status.profiles.converting_count(), 1);
        drop(second);
        assert_eq!(status.profiles.converting_count(), 0);
    }

    #[tokio::test]
    async fn aborted_conversion_is_no_longer_converting() {
        let status = Arc::new(Status::new());
        let task = tokio::spawn({
            let status = status.clone();
            async move {
                let _converting = status.profiles.converting();
                std::future::pending::<()>().await;
            }
        });
        while status.profiles.converting_count() == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(status.profiles.converting_count(), 0);
    }

    #[test]
    fn done_when_every_profile_completed() {
        let status = Status::new();
        status.profiles.set_total(2);
        status.profiles.inc_complete();
        assert!(!status.profiles.done());
        status.profiles.inc_failed();
        status.profiles.inc_complete();
        assert!(status.profiles.done());
        assert_eq!(status.profiles.failed_count(), 1);
    }
}
