use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};

use chrono::{DateTime, Local};

/// Connection and routing counters for one listener
#[derive(Debug)]
pub struct ListenerStats {
    pub name:String,
    pub idle_timeout_ms: u64,
    pub started: DateTime<Local>,
    pub total: Arc<AtomicUsize>,
    pub active: Arc<AtomicUsize>,
    pub routed: Arc<AtomicUsize>,
    pub no_sni: Arc<AtomicUsize>,
    pub rejected: Arc<AtomicUsize>,
    pub downloaded_bytes: Arc<AtomicUsize>,
    pub uploaded_bytes: Arc<AtomicUsize>
}

impl ListenerStats{
    fn newau() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    pub fn new(name:&str, idletimeout:u64) -> Self {
        Self {
            name: name.into(),
            idle_timeout_ms: idletimeout,
            started: Local::now(),
            total: Self::newau(),
            active: Self::newau(),
            routed: Self::newau(),
            no_sni: Self::newau(),
            rejected: Self::newau(),
            downloaded_bytes: Self::newau(),
            uploaded_bytes: Self::newau(),
        }
    }

    pub fn increase_conn_count(&self) -> usize {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decrease_conn_count(&self) -> usize {
        self.active.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn total_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn mark_routed(&self) -> usize {
        self.routed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn mark_no_sni(&self) -> usize {
        self.no_sni.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn mark_rejected(&self) -> usize {
        self.rejected.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn increase_uploaded_bytes(&self, count:usize) -> usize {
        self.uploaded_bytes.fetch_add(count, Ordering::SeqCst) + count
    }

    pub fn increase_downloaded_bytes(&self, count:usize) -> usize {
        self.downloaded_bytes.fetch_add(count, Ordering::SeqCst) + count
    }

    pub fn uploaded_bytes_count(&self) -> usize {
        self.uploaded_bytes.load(Ordering::SeqCst)
    }

    pub fn downloaded_bytes_count(&self) -> usize {
        self.downloaded_bytes.load(Ordering::SeqCst)
    }

    /// One line summary for the periodic stats report
    pub fn summary(&self) -> String {
        let uptime = Local::now().signed_duration_since(self.started).num_seconds();
        format!(
            "{}: active {} total {} routed {} no-sni {} rejected {} up {} down {} uptime {uptime}s",
            self.name,
            self.active_count(),
            self.total_count(),
            self.routed.load(Ordering::SeqCst),
            self.no_sni.load(Ordering::SeqCst),
            self.rejected.load(Ordering::SeqCst),
            self.uploaded_bytes_count(),
            self.downloaded_bytes_count(),
        )
    }
}
