//! 防抖与节流
//!
//! - `Debouncer`: 一串连续调用合并为最后一次调用之后 `delay` 触发的一次执行，参数取最后一次
//! - `Throttler`: 前沿节流，距上次执行不足 `interval` 的调用直接丢弃
//!
//! 计时使用 `tokio::time`，测试中可以暂停时间。`Debouncer::call` 需要在 tokio 运行时内调用。

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Action<T> = Box<dyn Fn(T) + Send + Sync>;

struct Pending<T> {
    generation: u64,
    args: Option<T>,
    timer: Option<JoinHandle<()>>,
}

struct DebounceState<T> {
    action: Action<T>,
    pending: Mutex<Pending<T>>,
}

impl<T> DebounceState<T> {
    fn lock(&self) -> MutexGuard<'_, Pending<T>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 计时器到期：只有仍是最后一次调用时才执行
    fn fire(&self, generation: u64) {
        let args = {
            let mut pending = self.lock();
            if pending.generation != generation {
                return;
            }
            pending.timer = None;
            pending.args.take()
        };
        if let Some(args) = args {
            (self.action)(args);
        }
    }
}

/// 防抖器
pub struct Debouncer<T> {
    state: Arc<DebounceState<T>>,
    delay: Duration,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new<F>(delay: Duration, action: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(DebounceState {
                action: Box::new(action),
                pending: Mutex::new(Pending {
                    generation: 0,
                    args: None,
                    timer: None,
                }),
            }),
            delay,
        }
    }

    /// 记录参数并重新计时
    pub fn call(&self, args: T) {
        let mut pending = self.state.lock();
        pending.generation += 1;
        pending.args = Some(args);
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }

        let generation = pending.generation;
        let state = Arc::clone(&self.state);
        let delay = self.delay;
        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.fire(generation);
        }));
    }

    /// 丢弃待执行的调用，返回是否有待执行的调用
    pub fn cancel(&self) -> bool {
        let mut pending = self.state.lock();
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.generation += 1;
        pending.args.take().is_some()
    }

    /// 立即执行待执行的调用，返回是否执行了
    pub fn flush(&self) -> bool {
        let args = {
            let mut pending = self.state.lock();
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            pending.generation += 1;
            pending.args.take()
        };
        match args {
            Some(args) => {
                (self.state.action)(args);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().args.is_some()
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        let mut pending = self.state.lock();
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.args = None;
    }
}

/// 前沿节流器
pub struct Throttler<T> {
    action: Action<T>,
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl<T> Throttler<T> {
    pub fn new<F>(interval: Duration, action: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            action: Box::new(action),
            interval,
            last: Mutex::new(None),
        }
    }

    /// 执行或丢弃本次调用，返回是否执行
    pub fn call(&self, args: T) -> bool {
        {
            let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            if last.is_some_and(|at| now.duration_since(at) < self.interval) {
                return false;
            }
            *last = Some(now);
        }
        (self.action)(args);
        true
    }

    /// 清除节流窗口，下一次调用立即执行
    pub fn reset(&self) {
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) + Send + Sync + 'static) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        (calls, move |n: u32| sink.lock().unwrap().push(n))
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_burst_uses_last_args() {
        let (calls, action) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(200), action);

        for n in 1..=5 {
            debouncer.call(n);
            sleep(Duration::from_millis(50)).await;
        }
        assert!(calls.lock().unwrap().is_empty());
        assert!(debouncer.is_pending());

        sleep(Duration::from_millis(200)).await;
        assert_eq!(*calls.lock().unwrap(), vec![5]);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_separate_bursts() {
        let (calls, action) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(100), action);

        debouncer.call(1);
        sleep(Duration::from_millis(150)).await;
        debouncer.call(2);
        sleep(Duration::from_millis(150)).await;
        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_cancel() {
        let (calls, action) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(100), action);

        debouncer.call(1);
        assert!(debouncer.cancel());
        assert!(!debouncer.cancel());
        sleep(Duration::from_millis(200)).await;
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_flush() {
        let (calls, action) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(100), action);

        debouncer.call(7);
        assert!(debouncer.flush());
        assert_eq!(*calls.lock().unwrap(), vec![7]);

        // 计时器不会再次触发
        sleep(Duration::from_millis(200)).await;
        assert_eq!(*calls.lock().unwrap(), vec![7]);
        assert!(!debouncer.flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_drop_aborts_timer() {
        let (calls, action) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(100), action);
        debouncer.call(1);
        drop(debouncer);
        sleep(Duration::from_millis(200)).await;
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_leading_edge() {
        let (calls, action) = recorder();
        let throttler = Throttler::new(Duration::from_millis(100), action);

        assert!(throttler.call(1));
        assert!(!throttler.call(2));
        sleep(Duration::from_millis(50)).await;
        assert!(!throttler.call(3));
        sleep(Duration::from_millis(60)).await;
        assert!(throttler.call(4));
        assert_eq!(*calls.lock().unwrap(), vec![1, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_reset() {
        let (calls, action) = recorder();
        let throttler = Throttler::new(Duration::from_secs(10), action);

        assert!(throttler.call(1));
        throttler.reset();
        assert!(throttler.call(2));
        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
    }
}
