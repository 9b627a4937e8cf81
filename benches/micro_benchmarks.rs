use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use runtree::graph::NodeKey;
use runtree::prelude::*;

struct Gain(Sample);

impl Behavior for Gain {
    fn name(&self) -> &str {
        "gain"
    }
    fn duplicate(&self) -> Box<dyn Behavior> {
        Box::new(Gain(self.0))
    }
    fn run(&mut self, ctx: &RunContext) -> OperatorStatus {
        if ctx.stage == Stage::Inter {
            self.0 = black_box(self.0 * 0.5 + 0.25);
        }
        OperatorStatus::Continue
    }
}

/// A mixer fed by `sources` chains of `depth` units, each unit with one
/// operator, and a play on the mixer output.
fn mixer_graph(sources: usize, depth: usize) -> (Graph, RunInstanceKey, Vec<NodeKey>) {
    let mut graph = Graph::default();
    let mixer = graph.add_unit(
        UnitSettings::default()
            .flags(UnitFlags::ASYNC | UnitFlags::OWNS_INPUT_RECYCLING)
            .input_pads(sources),
    );
    let mut feeds = vec![];
    for pad in 0..sources {
        let mut downstream = graph.unit(mixer).unwrap().inputs()[pad];
        for _ in 0..depth {
            let unit = graph.add_unit(UnitSettings::default());
            graph
                .add_template(unit, Operator::template(Gain(1.0)))
                .unwrap();
            let out = graph.unit(unit).unwrap().outputs()[0];
            graph.set_link(out, Some(downstream)).unwrap();
            downstream = graph.unit(unit).unwrap().inputs()[0];
        }
        feeds.push(graph.link_of(graph.unit(mixer).unwrap().inputs()[pad]).unwrap());
    }
    let mixer_out = graph.unit(mixer).unwrap().outputs()[0];
    let root = graph.start_playback(mixer_out, Purpose::PLAYBACK).unwrap();
    (graph, root, feeds)
}

pub fn relink(c: &mut Criterion) {
    c.bench_function("unlink and relink a chain of 8 under a play", |b| {
        b.iter_batched(
            || mixer_graph(4, 8),
            |(mut graph, _root, feeds)| {
                let input = graph.link_of(feeds[1]).unwrap();
                graph.set_link(feeds[1], None).unwrap();
                black_box(graph.set_link(feeds[1], Some(input)).unwrap());
            },
            BatchSize::SmallInput,
        )
    });
    c.bench_function("resize mixer pads under a play", |b| {
        b.iter_batched(
            || mixer_graph(4, 2),
            |(mut graph, root, _)| {
                let top = graph.run_instance(root).unwrap().group();
                let mixer = graph.run_group(top).unwrap().origin().unwrap();
                let unit = graph.node(mixer).unwrap().unit();
                graph.set_pad_count(unit, Side::Input, 8).unwrap();
                graph.set_pad_count(unit, Side::Input, 2).unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

pub fn run_plans(c: &mut Criterion) {
    let (graph, root, _) = mixer_graph(8, 8);
    c.bench_function("plan a play of 8x8", |b| {
        b.iter(|| black_box(StageRunner::default().plan(&graph, root).unwrap()))
    });
    let plan = StageRunner::default().plan(&graph, root).unwrap();
    c.bench_function("run a period of 8x8", |b| b.iter(|| plan.run_period()));
    let parallel = StageRunner::new(true).plan(&graph, root).unwrap();
    c.bench_function("run a period of 8x8 with parallel fan in", |b| {
        b.iter(|| parallel.run_period())
    });
}

criterion_group!(benches, relink, run_plans);
criterion_main!(benches);
