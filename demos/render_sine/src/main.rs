//! Offline render of `out = sin(t * 440) * 0.5`, built through the
//! public graph API, compiled, and executed block by block.

use std::sync::Arc;

use cadenza_core::native_module::ConstantValue;
use cadenza_core::{builtin, StreamStatus};
use cadenza_engine::{Engine, ExecutorConfig};
use cadenza_graph::ExecutionGraph;

const SAMPLE_RATE: u32 = 48_000;
const BLOCK_FRAMES: usize = 128;
const BLOCKS: usize = 8;

fn main() {
    simple_log::quick!("info");

    println!("Cadenza sine render...");

    let modules = Arc::new(builtin::native_module_registry());
    let tasks = Arc::new(builtin::task_function_registry());

    let mut graph = ExecutionGraph::new();
    let t = graph.add_graph_input_node(0);
    let freq = graph.add_constant_node(ConstantValue::Real(440.0));
    let gain = graph.add_constant_node(ConstantValue::Real(0.5));
    let mul = graph
        .add_module_call_node(&modules, builtin::modules::MULTIPLY)
        .unwrap();
    let sin = graph
        .add_module_call_node(&modules, builtin::modules::SIN)
        .unwrap();
    let scale = graph
        .add_module_call_node(&modules, builtin::modules::MULTIPLY)
        .unwrap();
    let out = graph.add_graph_output_node(0);

    graph
        .add_edge(t, graph.call_indexed_input(mul, 0).unwrap())
        .unwrap();
    graph
        .add_edge(freq, graph.call_indexed_input(mul, 1).unwrap())
        .unwrap();
    graph
        .add_edge(
            graph.call_indexed_output(mul, 0).unwrap(),
            graph.call_indexed_input(sin, 0).unwrap(),
        )
        .unwrap();
    graph
        .add_edge(
            graph.call_indexed_output(sin, 0).unwrap(),
            graph.call_indexed_input(scale, 0).unwrap(),
        )
        .unwrap();
    graph
        .add_edge(gain, graph.call_indexed_input(scale, 1).unwrap())
        .unwrap();
    graph
        .add_edge(graph.call_indexed_output(scale, 0).unwrap(), out)
        .unwrap();

    let (mut engine, mut executor) = Engine::new(
        modules,
        tasks,
        ExecutorConfig {
            threads: 2,
            max_block_frames: BLOCK_FRAMES,
            sample_rate: SAMPLE_RATE,
            ..Default::default()
        },
    );

    if let Err(e) = engine.load_program(&graph) {
        log::error!("{e}");
        return;
    }

    let mut rendered = Vec::with_capacity(BLOCK_FRAMES * BLOCKS);
    let mut peak = 0.0f32;

    for block in 0..BLOCKS {
        let t_values: Vec<f32> = (0..BLOCK_FRAMES)
            .map(|i| (block * BLOCK_FRAMES + i) as f32 / SAMPLE_RATE as f32)
            .collect();

        let mut samples = vec![0.0f32; BLOCK_FRAMES];
        let mut channels = [samples.as_mut_slice()];
        executor.process_block(
            BLOCK_FRAMES,
            &[&t_values],
            &mut channels,
            StreamStatus::empty(),
        );

        peak = samples.iter().fold(peak, |p, s| p.max(s.abs()));
        rendered.extend_from_slice(&samples);
        engine.update();
    }

    println!(
        "rendered {} samples, peak {:.4}, first four: {:?}",
        rendered.len(),
        peak,
        &rendered[..4]
    );
    println!("executor load: {:.2}% of block budget", executor.load() * 100.0);
}
