//! Bounded per-tier FIFO lanes.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Queue size from queueing theory: `Q = ceil(peak / (service - peak))`
/// with a safety factor of 2, rounded up to a power of two so the modulus
/// is a bitmask. Falls back to a fixed depth when the service rate does
/// not dominate the arrival rate.
pub fn queue_capacity(arrival_peak: f64, service_rate: f64) -> usize {
    const FALLBACK: usize = 1024;
    if service_rate <= arrival_peak || arrival_peak <= 0.0 {
        return FALLBACK;
    }
    let q = (arrival_peak / (service_rate - arrival_peak)).ceil() as usize;
    (q.max(1) * 2).next_power_of_two()
}

/// A bounded FIFO. Push never blocks: a full lane refuses immediately.
pub struct Lane<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> Lane<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "lane capacity must be a power of two");
        Self { queue: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    /// Enqueue, or hand the job back if the lane is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut queue = self.queue.lock();
        if queue.len() == self.capacity {
            return Err(item);
        }
        queue.push_back(item);
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Occupancy as a fraction of capacity.
    pub fn occupancy(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_capacity_formula() {
        // peak 100/s against service 150/s: ceil(100/50)=2, x2 = 4.
        assert_eq!(queue_capacity(100.0, 150.0), 4);
        // peak 90 against 100: ceil(9)=9, x2=18 -> 32.
        assert_eq!(queue_capacity(90.0, 100.0), 32);
        // Saturated service falls back.
        assert_eq!(queue_capacity(100.0, 100.0), 1024);
        assert_eq!(queue_capacity(0.0, 100.0), 1024);
    }

    #[test]
    fn test_capacity_always_power_of_two() {
        for (peak, rate) in [(1.0, 3.0), (7.0, 11.0), (100.0, 101.0), (3.0, 1000.0)] {
            assert!(queue_capacity(peak, rate).is_power_of_two());
        }
    }

    #[test]
    fn test_lane_fifo() {
        let lane = Lane::new(4);
        lane.try_push(1).unwrap();
        lane.try_push(2).unwrap();
        assert_eq!(lane.pop(), Some(1));
        assert_eq!(lane.pop(), Some(2));
        assert_eq!(lane.pop(), None);
    }

    #[test]
    fn test_full_lane_refuses() {
        let lane = Lane::new(2);
        lane.try_push(1).unwrap();
        lane.try_push(2).unwrap();
        assert_eq!(lane.try_push(3), Err(3));
        assert_eq!(lane.occupancy(), 1.0);
    }
}
