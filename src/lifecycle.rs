use crate::compute::backend::{ComputeQueue, ResourceId};

/// Every queue resource one job allocated and has not yet released.
///
/// Resources are never shared across jobs. Callers release explicitly as soon as a resource is
/// no longer needed and call [`JobResources::release_all`] on every exit path; a set dropped while
/// still holding handles is reported as a leak.
#[derive(Debug, Default)]
pub struct JobResources {
    held: Vec<ResourceId>,
}

impl JobResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, id: ResourceId) -> ResourceId {
        self.held.push(id);
        id
    }

    /// Release one handle early. Handles not owned by this job are left alone.
    pub fn release(&mut self, queue: &mut dyn ComputeQueue, id: ResourceId) {
        if let Some(pos) = self.held.iter().position(|h| *h == id) {
            self.held.remove(pos);
            queue.release(id);
        }
    }

    /// Release everything still held, most recent allocation first.
    pub fn release_all(&mut self, queue: &mut dyn ComputeQueue) {
        while let Some(id) = self.held.pop() {
            queue.release(id);
        }
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for JobResources {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            tracing::warn!(
                leaked = self.held.len(),
                "job resources dropped without release"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::cpu::CpuQueue;

    #[test]
    fn release_is_scoped_to_tracked_handles() {
        let mut q = CpuQueue::new(16);
        let mut res = JobResources::new();
        let a = res.track(q.create_stats_buffer().unwrap());
        let b = res.track(q.create_stats_buffer().unwrap());
        let foreign = q.create_stats_buffer().unwrap();

        res.release(&mut q, foreign);
        assert_eq!(q.live_resources(), 3);

        res.release(&mut q, a);
        assert_eq!(res.len(), 1);
        assert_eq!(q.live_resources(), 2);

        res.release_all(&mut q);
        assert!(res.is_empty());
        assert_eq!(q.live_resources(), 1);
        let _ = b;
    }
}
