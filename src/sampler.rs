use anyhow::{bail, Context, Result};
use itertools::Itertools;
use rayon::{prelude::*, ScopeFifo, ThreadPoolBuilder};
use std::{
    sync::{
        mpsc::{
            channel, sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError,
        },
        Arc, Mutex,
    },
    thread::{spawn, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    chain::{BridgeChain, Progress},
    design::DesignMatrix,
    error::BridgeError,
    likelihood::Likelihood,
    samples::PosteriorSamples,
    settings::BridgeSettings,
};

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ChainProgress {
    pub finished_sweeps: usize,
    pub total_sweeps: usize,
    pub burn_in: bool,
    pub started: bool,
    pub active_size: usize,
    pub accepted_moves: usize,
    pub impossible_moves: usize,
    pub cg_fallbacks: usize,
    pub retries: usize,
    pub runtime: Duration,
}

impl ChainProgress {
    fn new(total: usize) -> Self {
        Self {
            finished_sweeps: 0,
            total_sweeps: total,
            burn_in: true,
            started: false,
            active_size: 0,
            accepted_moves: 0,
            impossible_moves: 0,
            cg_fallbacks: 0,
            retries: 0,
            runtime: Duration::ZERO,
        }
    }

    fn update(&mut self, stats: &Progress, sweep_duration: Duration) {
        self.finished_sweeps += 1;
        self.burn_in = stats.burn_in;
        self.active_size = stats.active_size;
        if stats.move_accepted {
            self.accepted_moves += 1;
        }
        if !stats.move_possible {
            self.impossible_moves += 1;
        }
        if stats.fallback() {
            self.cg_fallbacks += 1;
        }
        self.retries += stats.retries as usize;
        self.runtime += sweep_duration;
    }
}

enum ChainCommand {
    Resume,
    Pause,
}

struct ChainProcess {
    stop_marker: Sender<ChainCommand>,
    trace: Arc<Mutex<Option<PosteriorSamples>>>,
    progress: Arc<Mutex<ChainProgress>>,
}

impl ChainProcess {
    fn finalize_many(chains: Vec<Self>) -> Vec<Option<PosteriorSamples>> {
        chains
            .into_iter()
            .map(|chain| chain.finalize())
            .collect_vec()
    }

    fn progress(&self) -> ChainProgress {
        self.progress.lock().expect("Poisoned lock").clone()
    }

    fn current_trace(&self) -> Option<PosteriorSamples> {
        self.trace.lock().expect("Poisoned lock").clone()
    }

    fn resume(&self) -> Result<()> {
        self.stop_marker.send(ChainCommand::Resume)?;
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.stop_marker.send(ChainCommand::Pause)?;
        Ok(())
    }

    fn finalize(self) -> Option<PosteriorSamples> {
        drop(self.stop_marker);
        self.trace.lock().expect("Poisoned lock").take()
    }

    fn start<'scope, 'problem, L: Likelihood>(
        design: Arc<DesignMatrix>,
        likelihood: &'problem L,
        chain_id: u64,
        settings: &'problem BridgeSettings,
        scope: &ScopeFifo<'scope>,
        results: Sender<Result<()>>,
    ) -> Self
    where
        'problem: 'scope,
    {
        let (stop_marker_tx, stop_marker_rx) = channel();

        let trace = Arc::new(Mutex::new(None));
        let progress = Arc::new(Mutex::new(ChainProgress::new(
            settings.total_iterations() as usize,
        )));

        let trace_inner = trace.clone();
        let progress_inner = progress.clone();

        scope.spawn_fifo(move |_| {
            let trace = trace_inner;
            let progress = progress_inner;

            let sample = move || {
                let mut chain = BridgeChain::new(design, likelihood.clone(), settings, chain_id)
                    .with_context(|| format!("Could not initialize chain {chain_id}"))?;

                *trace.lock().expect("Poisoned mutex") = Some(chain.new_samples());
                progress.lock().expect("Poisoned mutex").started = true;

                let mut msg = stop_marker_rx.try_recv();
                while !chain.is_finished() {
                    match msg {
                        // The remote end is dead
                        Err(TryRecvError::Disconnected) => {
                            break;
                        }
                        Err(TryRecvError::Empty) => {}
                        Ok(ChainCommand::Pause) => {
                            msg = stop_marker_rx.recv().map_err(|e| e.into());
                            continue;
                        }
                        Ok(ChainCommand::Resume) => {}
                    }

                    let now = Instant::now();
                    let info = chain
                        .draw()
                        .with_context(|| format!("Chain {chain_id} failed"))?;
                    let mut guard = trace
                        .lock()
                        .expect("Could not unlock trace lock. Poisoned mutex");

                    let Some(samples) = guard.as_mut() else {
                        // The trace was removed by controller thread. We can stop sampling
                        break;
                    };
                    progress
                        .lock()
                        .expect("Poisoned mutex")
                        .update(&info, now.elapsed());
                    chain.record(samples, info);
                    drop(guard);

                    msg = stop_marker_rx.try_recv();
                }
                Ok(())
            };

            let result = sample();

            results
                .send(result)
                .expect("Could not send sampling results to main thread.");
            drop(results);
        });

        Self {
            trace,
            stop_marker: stop_marker_tx,
            progress,
        }
    }
}

#[derive(Debug)]
enum SamplerCommand {
    Pause,
    Continue,
    InspectTrace,
    Progress,
}

enum SamplerResponse {
    Ok(),
    IntermediateTrace(Trace),
    Progress(Box<[ChainProgress]>),
}

pub enum SamplerWaitResult {
    Trace(Trace),
    Timeout(Sampler),
    Err(anyhow::Error, Option<Trace>),
}

/// Samples of all chains of a run, ordered by chain.
#[derive(Debug, Clone)]
pub struct Trace {
    pub chains: Vec<PosteriorSamples>,
}

impl<I: Iterator<Item = PosteriorSamples>> From<I> for Trace {
    fn from(value: I) -> Self {
        let mut chains = value.into_iter().collect_vec();
        chains.sort_unstable_by_key(|x| x.chain());
        Trace { chains }
    }
}

impl Trace {
    pub fn num_snapshots(&self) -> usize {
        self.chains.iter().map(|chain| chain.len()).sum()
    }

    /// Inclusion probabilities pooled over all chains.
    pub fn inclusion_probabilities(&self) -> Vec<f64> {
        self.pooled(PosteriorSamples::inclusion_probabilities)
    }

    /// Posterior means pooled over all chains.
    pub fn posterior_means(&self) -> Vec<f64> {
        self.pooled(PosteriorSamples::posterior_means)
    }

    fn pooled(&self, summary: impl Fn(&PosteriorSamples) -> Vec<f64>) -> Vec<f64> {
        let total = self.num_snapshots();
        let p = self.chains.first().map(|c| c.num_predictors()).unwrap_or(0);
        let mut pooled = vec![0f64; p];
        if total == 0 {
            return pooled;
        }
        for chain in &self.chains {
            let weight = chain.len() as f64 / total as f64;
            for (out, value) in pooled.iter_mut().zip(summary(chain)) {
                *out += weight * value;
            }
        }
        pooled
    }
}

/// Runs `settings.num_chains` chains on a background thread pool.
///
/// The handle can pause and resume the chains, report their progress and
/// return the samples collected so far. Dropping the handle through
/// [`Sampler::abort`] stops all chains after their current sweep.
pub struct Sampler {
    main_thread: JoinHandle<Result<Vec<Option<PosteriorSamples>>>>,
    commands: SyncSender<SamplerCommand>,
    responses: Receiver<SamplerResponse>,
    results: Receiver<Result<()>>,
}

impl Sampler {
    pub fn new<L: Likelihood>(
        design: Arc<DesignMatrix>,
        likelihood: L,
        settings: BridgeSettings,
        num_cores: usize,
    ) -> Result<Self> {
        settings
            .validate(design.ncols())
            .context("Invalid sampler settings")?;

        let (commands_tx, commands_rx) = sync_channel(0);
        let (responses_tx, responses_rx) = sync_channel(0);
        let (results_tx, results_rx) = channel();

        let main_thread = spawn(move || {
            let pool = ThreadPoolBuilder::new()
                .num_threads(num_cores + 1) // One more thread because the controller also uses one
                .thread_name(|i| format!("bridge-worker-{}", i))
                .build()
                .context("Could not start thread pool")?;

            let settings_ref = &settings;
            let likelihood_ref = &likelihood;

            pool.scope_fifo(move |scope| {
                let results = results_tx;
                let mut chains = Vec::with_capacity(settings_ref.num_chains);

                for chain_id in 0..settings_ref.num_chains {
                    let chain = ChainProcess::start(
                        design.clone(),
                        likelihood_ref,
                        chain_id as u64,
                        settings_ref,
                        scope,
                        results.clone(),
                    );
                    chains.push(chain);
                }
                drop(results);

                let main_loop = || loop {
                    match commands_rx.recv() {
                        Ok(SamplerCommand::Pause) => {
                            for chain in chains.iter() {
                                // Fails for chains that are already done.
                                let _ = chain.pause();
                            }
                            responses_tx.send(SamplerResponse::Ok())?;
                        }
                        Ok(SamplerCommand::Continue) => {
                            for chain in chains.iter() {
                                // Fails for chains that are already done.
                                let _ = chain.resume();
                            }
                            responses_tx.send(SamplerResponse::Ok())?;
                        }
                        Ok(SamplerCommand::InspectTrace) => {
                            let trace: Trace = chains
                                .iter()
                                .filter_map(|chain| chain.current_trace())
                                .into();
                            responses_tx.send(SamplerResponse::IntermediateTrace(trace))?;
                        }
                        Ok(SamplerCommand::Progress) => {
                            let progress =
                                chains.iter().map(|chain| chain.progress()).collect_vec();
                            responses_tx.send(SamplerResponse::Progress(progress.into()))?;
                        }
                        // The handle was dropped by `abort`.
                        Err(_) => return Ok(()),
                    }
                };
                let result: Result<()> = main_loop();
                // Run finalization even if something failed
                let output = Ok(ChainProcess::finalize_many(chains));

                result?;
                output
            })
        });

        Ok(Self {
            main_thread,
            commands: commands_tx,
            responses: responses_rx,
            results: results_rx,
        })
    }

    pub fn pause(&mut self) -> Result<()> {
        self.commands
            .send(SamplerCommand::Pause)
            .context("Could not send pause command to controller thread")?;
        let response = self
            .responses
            .recv()
            .context("Could not recieve pause response from controller thread")?;
        let SamplerResponse::Ok() = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.commands.send(SamplerCommand::Continue)?;
        let response = self.responses.recv()?;
        let SamplerResponse::Ok() = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(())
    }

    /// Stop all chains after their current sweep and return what they have
    /// sampled so far, together with the first chain failure if any.
    pub fn abort(self) -> (Result<()>, Option<Trace>) {
        drop(self.commands);
        let result = self.main_thread.join();
        let chain_error = self.results.try_iter().find_map(|result| result.err());
        match result {
            Err(payload) => std::panic::resume_unwind(payload),
            Ok(Ok(traces)) => {
                let trace: Trace = traces.into_iter().flatten().into();
                match chain_error {
                    Some(err) => (Err(err), Some(trace)),
                    None => (Ok(()), Some(trace)),
                }
            }
            Ok(Err(err)) => (Err(err), None),
        }
    }

    pub fn inspect_trace(&mut self) -> Result<Trace> {
        self.commands.send(SamplerCommand::InspectTrace)?;
        let response = self.responses.recv()?;
        let SamplerResponse::IntermediateTrace(trace) = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(trace)
    }

    pub fn wait_timeout(self, timeout: Duration) -> SamplerWaitResult {
        let start = Instant::now();
        let mut remaining = Some(timeout);
        while let Some(left) = remaining {
            match self.results.recv_timeout(left) {
                Ok(Ok(_)) => remaining = timeout.checked_sub(start.elapsed()),
                Ok(Err(e)) => {
                    let (_, trace) = self.abort();
                    return SamplerWaitResult::Err(e, trace);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let (res, trace) = self.abort();
                    return match (res, trace) {
                        (Err(err), trace) => SamplerWaitResult::Err(err, trace),
                        (Ok(()), Some(trace)) => SamplerWaitResult::Trace(trace),
                        (Ok(()), None) => SamplerWaitResult::Err(
                            anyhow::anyhow!("Sampler finished without chains"),
                            None,
                        ),
                    };
                }
                Err(RecvTimeoutError::Timeout) => break,
            }
        }
        SamplerWaitResult::Timeout(self)
    }

    pub fn progress(&mut self) -> Result<Box<[ChainProgress]>> {
        self.commands.send(SamplerCommand::Progress)?;
        let response = self.responses.recv()?;
        let SamplerResponse::Progress(progress) = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(progress)
    }
}

/// Run all chains one after the other on the calling thread.
pub fn sample_sequential<L: Likelihood>(
    design: Arc<DesignMatrix>,
    likelihood: &L,
    settings: &BridgeSettings,
) -> (Result<(), BridgeError>, Trace) {
    let runs = (0..settings.num_chains as u64)
        .map(|chain| run_chain(design.clone(), likelihood, settings, chain))
        .collect_vec();
    collect_runs(runs)
}

/// Run all chains on the rayon thread pool. Each chain uses its own stream of
/// the same seed, so the result equals that of [`sample_sequential`].
pub fn sample_parallel<L: Likelihood>(
    design: Arc<DesignMatrix>,
    likelihood: &L,
    settings: &BridgeSettings,
) -> (Result<(), BridgeError>, Trace) {
    let runs = (0..settings.num_chains as u64)
        .into_par_iter()
        .map(|chain| run_chain(design.clone(), likelihood, settings, chain))
        .collect::<Vec<_>>();
    collect_runs(runs)
}

fn run_chain<L: Likelihood>(
    design: Arc<DesignMatrix>,
    likelihood: &L,
    settings: &BridgeSettings,
    chain: u64,
) -> (Result<(), BridgeError>, Option<PosteriorSamples>) {
    match BridgeChain::new(design, likelihood.clone(), settings, chain) {
        Ok(mut chain) => {
            let (result, samples) = chain.run();
            (result, Some(samples))
        }
        Err(err) => (Err(err), None),
    }
}

fn collect_runs(
    runs: Vec<(Result<(), BridgeError>, Option<PosteriorSamples>)>,
) -> (Result<(), BridgeError>, Trace) {
    let mut first_error = None;
    let mut chains = vec![];
    for (result, samples) in runs {
        if let Err(err) = result {
            first_error.get_or_insert(err);
        }
        chains.extend(samples);
    }
    let trace: Trace = chains.into_iter().into();
    (first_error.map_or(Ok(()), Err), trace)
}
