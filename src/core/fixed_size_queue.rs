use std::collections::VecDeque;

// 固定容量环形缓冲，写满后覆盖最旧数据
#[derive(Debug, Clone)]
pub struct FixedSizeQueue<T> {
    queue: VecDeque<T>,
    capacity: usize,
}

impl<T: Copy> FixedSizeQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        FixedSizeQueue {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.queue.len() == self.capacity {
            self.queue.pop_front();
        }
        self.queue.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.queue.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overwrites_oldest_when_full() {
        let mut q = FixedSizeQueue::new(3);
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn test_len_never_exceeds_capacity() {
        let mut q = FixedSizeQueue::new(100);
        for i in 0..10_000 {
            q.push(i as f64);
        }
        assert_eq!(q.len(), q.capacity());
        assert_eq!(q.len(), 100);
    }
}
