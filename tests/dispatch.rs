use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tensor_dispatch::backend::FanOut;
use tensor_dispatch::scheduler::HostLock;
use tensor_dispatch::{
    ArrayLike, Backend, BackendPolicy, CpuCapabilities, DispatchReason, DispatchRecord,
    Dispatcher, Error, ErrorCategory, HostArray, OpOutput, Operation, RuntimeConfig, Scalar,
    Thresholds, extract_buffer, explain_last_dispatch, get_backend_policy, ops,
    set_backend_policy, validate_and_allocate,
};

/// Serialises the tests that touch the global dispatcher.
static GLOBAL_STATE: Mutex<()> = Mutex::new(());

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn dispatcher(threads: usize, thresholds: Thresholds, library: bool) -> Dispatcher {
    let config = RuntimeConfig::default()
        .with_num_threads(threads)
        .with_thresholds(thresholds);
    let caps = *CpuCapabilities::get();
    let caps = if library { caps } else { caps.without_library() };
    Dispatcher::with_capabilities(&config, caps)
}

fn run<T: ArrayLike + ?Sized>(
    d: &Dispatcher,
    op: Operation,
    operands: &[&T],
) -> Result<(OpOutput, DispatchRecord), Error> {
    let descriptors = operands
        .iter()
        .map(|x| extract_buffer(*x, None))
        .collect::<Result<Vec<_>, _>>()?;
    let (validated, output) = validate_and_allocate(op, descriptors)?;
    d.dispatch(validated, output)
}

#[test]
fn test_force_scalar_holds_at_every_size() {
    init_tracing();
    let forced = dispatcher(4, Thresholds::default(), true);
    forced.set_policy(BackendPolicy::ForceScalar);
    let auto = dispatcher(4, Thresholds::default(), true);

    for len in [1, 7, 8, 9, 1_000, 300_000] {
        let a: Vec<f32> = (0..len).map(|i| (i % 97) as f32 * 0.5).collect();
        let b: Vec<f32> = (0..len).map(|i| (i % 13) as f32 - 6.0).collect();
        let (scalar_out, record) = run(&forced, Operation::Add, &[a.as_slice(), b.as_slice()]).unwrap();
        assert_eq!(record.backend_selected, Backend::Scalar, "len {len}");
        assert_eq!(record.policy_in_effect, BackendPolicy::ForceScalar);
        assert!(matches!(record.reason, DispatchReason::Forced { .. }));

        let (auto_out, _) = run(&auto, Operation::Add, &[a.as_slice(), b.as_slice()]).unwrap();
        assert_eq!(scalar_out, auto_out, "len {len}");
    }
}

#[test]
fn test_auto_uses_scalar_below_one_lane() {
    let d = dispatcher(1, Thresholds::default(), true);
    let small = [1.0f64; 7];
    let (_, record) = run(&d, Operation::Sum, &[&small[..]]).unwrap();
    assert_eq!(record.backend_selected, Backend::Scalar);
    let lane = [1.0f64; 8];
    let (_, record) = run(&d, Operation::Sum, &[&lane[..]]).unwrap();
    assert_eq!(record.backend_selected, Backend::Vectorized);
}

fn square(dim: usize) -> HostArray {
    HostArray::from_vec([dim, dim], vec![1.0f32; dim * dim])
}

#[test]
fn test_library_threshold_flips_exactly_at_the_threshold() {
    let thresholds = Thresholds {
        library: 16,
        ..Thresholds::default()
    };
    let d = dispatcher(2, thresholds, true);
    for (dim, crossed) in [(15, false), (16, true), (17, true)] {
        let m = square(dim);
        let (out, record) = run(&d, Operation::Matmul, &[&m, &m]).unwrap();
        let expected = if crossed && cfg!(feature = "library") {
            Backend::Library
        } else {
            Backend::Vectorized
        };
        assert_eq!(record.backend_selected, expected, "dim {dim}");
        assert_eq!(record.chunks, 1);
        let product = out.into_array().unwrap();
        #[allow(clippy::cast_precision_loss)]
        let dim_f = dim as f32;
        assert!(product.as_slice::<f32>().unwrap().iter().all(|&x| x == dim_f));
    }
}

#[test]
fn test_missing_library_falls_back_with_a_reason() {
    let thresholds = Thresholds {
        library: 4,
        ..Thresholds::default()
    };
    let d = dispatcher(1, thresholds, false);
    let m = square(4);
    let (_, record) = run(&d, Operation::Matmul, &[&m, &m]).unwrap();
    assert_eq!(record.backend_selected, Backend::Vectorized);
    assert!(matches!(record.reason, DispatchReason::LibraryUnavailable { .. }));

    d.set_policy(BackendPolicy::ForceLibrary);
    let err = run(&d, Operation::Matmul, &[&m, &m]).unwrap_err();
    assert!(matches!(err, Error::UnsupportedBackendForOperation { .. }));
    assert_eq!(err.category(), ErrorCategory::Dispatch);
}

#[test]
fn test_reduction_fan_out_flips_exactly_at_the_threshold() {
    let thresholds = Thresholds {
        reduction_parallel: 1_000,
        ..Thresholds::default()
    };
    let d = dispatcher(4, thresholds, true);
    for (len, chunks) in [(999, 1), (1_000, 4), (1_001, 4)] {
        let data = vec![1i64; len];
        let (out, record) = run(&d, Operation::Sum, &[data.as_slice()]).unwrap();
        assert_eq!(record.chunks, chunks, "len {len}");
        match record.reason {
            DispatchReason::Vectorized {
                fan_out: FanOut::Serial { .. },
            } => assert_eq!(chunks, 1),
            DispatchReason::Vectorized {
                fan_out: FanOut::Parallel { .. },
            } => assert_eq!(chunks, 4),
            other => panic!("unexpected reason {other}"),
        }
        assert_eq!(out, OpOutput::Scalar(Scalar::I64(i64::try_from(len).unwrap())));
    }
}

#[test]
fn test_forced_library_rejects_elementwise() {
    let d = dispatcher(1, Thresholds::default(), true);
    d.set_policy(BackendPolicy::ForceLibrary);
    let x = [1.0f32, 2.0];
    let err = run(&d, Operation::Add, &[&x[..], &x[..]]).unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedBackendForOperation {
            op: Operation::Add,
            backend: Backend::Library,
            ..
        }
    ));
    assert!(d.last_dispatch().is_none());
}

#[derive(Default)]
struct CountingLock {
    releases: AtomicUsize,
}

impl HostLock for CountingLock {
    fn allow_threads<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.releases.fetch_add(1, Ordering::SeqCst);
        f()
    }
}

#[test]
fn test_host_lock_is_released_only_for_parallel_work() {
    let thresholds = Thresholds {
        elementwise_parallel: 64,
        ..Thresholds::default()
    };
    let d = dispatcher(4, thresholds, true);
    let lock = CountingLock::default();

    for (len, releases) in [(63usize, 0), (64, 1)] {
        let a = vec![2.0f64; len];
        let descriptors = vec![
            extract_buffer(a.as_slice(), None).unwrap(),
            extract_buffer(a.as_slice(), None).unwrap(),
        ];
        let (validated, output) = validate_and_allocate(Operation::Mul, descriptors).unwrap();
        let (out, _) = d.dispatch_with(validated, output, &lock).unwrap();
        assert_eq!(lock.releases.load(Ordering::SeqCst), releases, "len {len}");
        let out = out.into_array().unwrap();
        assert!(out.as_slice::<f64>().unwrap().iter().all(|&x| x == 4.0));
    }
}

/// Reads the dispatcher's state from inside the parallel section.
struct ReentrantLock<'d> {
    dispatcher: &'d Dispatcher,
    observed: AtomicUsize,
}

impl HostLock for ReentrantLock<'_> {
    fn allow_threads<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        assert_eq!(self.dispatcher.policy(), BackendPolicy::Auto);
        let previous = self.dispatcher.last_dispatch().map_or(0, |r| r.sequence);
        let out = f();
        assert_eq!(self.dispatcher.thresholds().elementwise_parallel, 64);
        self.observed.store(usize::try_from(previous).unwrap() + 1, Ordering::SeqCst);
        out
    }
}

#[test]
fn test_state_is_unlocked_while_kernels_run() {
    let thresholds = Thresholds {
        elementwise_parallel: 64,
        reduction_parallel: 64,
        ..Thresholds::default()
    };
    let d = dispatcher(4, thresholds, true);
    let lock = ReentrantLock {
        dispatcher: &d,
        observed: AtomicUsize::new(0),
    };
    for op in [Operation::Add, Operation::Sum, Operation::Add] {
        let a = vec![1.0f32; 256];
        let operands = if op == Operation::Sum { 1 } else { 2 };
        let descriptors = (0..operands)
            .map(|_| extract_buffer(a.as_slice(), None))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let (validated, output) = validate_and_allocate(op, descriptors).unwrap();
        let (_, record) = d.dispatch_with(validated, output, &lock).unwrap();
        assert_eq!(record.chunks, 4);
        assert_eq!(
            lock.observed.load(Ordering::SeqCst),
            usize::try_from(record.sequence).unwrap()
        );
    }
}

#[test]
fn test_concurrent_dispatches_get_distinct_sequences() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 25;
    let d = dispatcher(2, Thresholds::default(), true);
    let x: Vec<f64> = (0..300).map(f64::from).collect();

    let per_thread: Vec<Vec<u64>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    (0..PER_THREAD)
                        .map(|_| {
                            let (out, record) = run(&d, Operation::Sum, &[x.as_slice()]).unwrap();
                            assert_eq!(out, OpOutput::Scalar(Scalar::F64(44_850.0)));
                            record.sequence
                        })
                        .collect()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for sequences in &per_thread {
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    }
    let mut all: Vec<u64> = per_thread.into_iter().flatten().collect();
    all.sort_unstable();
    let expected: Vec<u64> = (1..=u64::try_from(THREADS * PER_THREAD).unwrap()).collect();
    assert_eq!(all, expected);
}

#[test]
fn test_record_renders_one_line() {
    let d = dispatcher(1, Thresholds::default(), true);
    let x = [1.0f32; 12];
    let (_, record) = run(&d, Operation::Sum, &[&x[..]]).unwrap();
    let line = record.to_string();
    assert!(line.starts_with("#1 sum → vectorized"), "{line}");
    assert!(line.contains("policy=auto"), "{line}");
    assert!(line.contains("below parallel threshold (12 < 1000000)"), "{line}");
    assert!(!line.contains('\n'));
}

#[test]
fn test_global_policy_and_explanation() {
    let _guard = GLOBAL_STATE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    init_tracing();

    set_backend_policy(BackendPolicy::ForceVectorized);
    assert_eq!(get_backend_policy(), BackendPolicy::ForceVectorized);
    let sum = ops::sum(&[1.0f64, 2.0, 3.0][..]).unwrap();
    assert_eq!(sum, Scalar::F64(6.0));

    let record = explain_last_dispatch().unwrap();
    assert_eq!(record.operation, Operation::Sum);
    assert_eq!(record.backend_selected, Backend::Vectorized);
    assert_eq!(record.policy_in_effect, BackendPolicy::ForceVectorized);
    assert_eq!(record.operand_shapes, vec![vec![3]]);
    assert!(record.reason.to_string().starts_with("forced by policy (force-vectorized)"));

    set_backend_policy(BackendPolicy::Auto);
    ops::sum(&[1.0f64; 3][..]).unwrap();
    let next = explain_last_dispatch().unwrap();
    assert!(next.sequence > record.sequence);
    assert_eq!(next.backend_selected, Backend::Scalar);
}

#[test]
fn test_policy_host_encoding() {
    let _guard = GLOBAL_STATE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    for (code, policy) in [
        (0u8, BackendPolicy::Auto),
        (1, BackendPolicy::ForceScalar),
        (2, BackendPolicy::ForceVectorized),
        (3, BackendPolicy::ForceLibrary),
    ] {
        assert_eq!(BackendPolicy::try_from(code), Ok(policy));
        assert_eq!(policy as u8, code);
        assert_eq!(policy.name().parse::<BackendPolicy>(), Ok(policy));
    }
    assert!(BackendPolicy::try_from(4).is_err());
}
