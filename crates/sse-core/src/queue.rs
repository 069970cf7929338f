use std::collections::VecDeque;

/// FIFO buffer of operations deferred while the session is unavailable.
///
/// [`RetryQueue::take_batch`] hands out exactly the entries present at the
/// time of the call; anything pushed while that batch is being dispatched
/// waits for the next batch.
#[derive(Debug)]
pub struct RetryQueue<T> {
    tasks: VecDeque<T>,
}

impl<T> Default for RetryQueue<T> {
    fn default() -> Self {
        Self {
            tasks: VecDeque::new(),
        }
    }
}

impl<T> RetryQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: T) {
        self.tasks.push_back(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn take_batch(&mut self) -> Vec<T> {
        std::mem::take(&mut self.tasks).into()
    }
}
