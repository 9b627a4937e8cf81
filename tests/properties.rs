use proptest::prelude::*;
use runtree::graph::{LinkError, NodeKey};
use runtree::prelude::*;

#[derive(Clone, Debug)]
enum Edit {
    Link { output: usize, input: usize },
    Unlink(usize),
    Pads { unit: usize, pads: usize },
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (0..16usize, 0..16usize).prop_map(|(output, input)| Edit::Link { output, input }),
        1 => (0..16usize).prop_map(Edit::Unlink),
        1 => (0..2usize, 1..4usize).prop_map(|(unit, pads)| Edit::Pads { unit, pads }),
    ]
}

struct Fixture {
    graph: Graph,
    units: Vec<UnitKey>,
    /// Units whose input pads can be resized
    resizable: Vec<UnitKey>,
}

fn fixture() -> Fixture {
    let mut graph = Graph::default();
    let plain = graph.add_unit(UnitSettings::default().name("plain"));
    let source = graph.add_unit(
        UnitSettings::default()
            .name("source")
            .flags(UnitFlags::OWNS_OUTPUT_RECYCLING),
    );
    let mixer = graph.add_unit(
        UnitSettings::default()
            .name("mixer")
            .flags(UnitFlags::ASYNC)
            .input_pads(2),
    );
    let bus = graph.add_unit(
        UnitSettings::default()
            .name("bus")
            .flags(UnitFlags::ASYNC | UnitFlags::OWNS_INPUT_RECYCLING)
            .input_pads(2),
    );
    Fixture {
        graph,
        units: vec![plain, source, mixer, bus],
        resizable: vec![mixer, bus],
    }
}

fn all_nodes(graph: &Graph, units: &[UnitKey], side: Side) -> Vec<NodeKey> {
    units
        .iter()
        .flat_map(|u| graph.unit(*u).unwrap().nodes(side).to_vec())
        .collect()
}

fn check_invariants(graph: &Graph, units: &[UnitKey]) -> Result<(), TestCaseError> {
    for side in [Side::Output, Side::Input] {
        for node in all_nodes(graph, units, side) {
            let n = graph.node(node).unwrap();
            if let Some(range) = n.range() {
                prop_assert!(graph.is_well_formed(range), "{node:?} has a broken chain");
            }
            if let Some(partner) = n.link() {
                prop_assert_eq!(graph.link_of(partner), Some(node));
                prop_assert_ne!(graph.node(partner).unwrap().side(), side);
            }
        }
    }
    for output in all_nodes(graph, units, Side::Output) {
        if let Some(input) = graph.link_of(output) {
            prop_assert!(!graph.would_loop(output, input));
        }
    }
    for root in graph.playbacks() {
        let top = graph.run_instance(root).unwrap().group();
        for key in graph.instances_of_play(top) {
            let holder = graph.run_instance(key).unwrap().holder();
            prop_assert!(graph.contains_holder(holder));
        }
        prop_assert!(graph.run_period(root).is_ok());
    }
    Ok(())
}

proptest! {
    #[test]
    fn edits_keep_the_graph_consistent(edits in prop::collection::vec(edit(), 1..40)) {
        let Fixture { mut graph, units, resizable } = fixture();
        let plain_out = graph.unit(units[0]).unwrap().outputs()[0];
        let bus_out = graph.unit(units[3]).unwrap().outputs()[0];
        graph.start_playback(plain_out, Purpose::PLAYBACK).unwrap();
        graph.start_playback(bus_out, Purpose::PLAYBACK).unwrap();

        for edit in edits {
            let outputs = all_nodes(&graph, &units, Side::Output);
            let inputs = all_nodes(&graph, &units, Side::Input);
            match edit {
                Edit::Link { output, input } => {
                    let output = outputs[output % outputs.len()];
                    let input = inputs[input % inputs.len()];
                    let before = graph.generate_inspection();
                    match graph.set_link(output, Some(input)) {
                        Ok(_) => prop_assert_eq!(graph.link_of(output), Some(input)),
                        Err(LinkError::LoopInLink) => {
                            prop_assert_eq!(graph.generate_inspection(), before)
                        }
                        Err(e) => prop_assert!(false, "unexpected error {e}"),
                    }
                }
                Edit::Unlink(node) => {
                    let node = inputs[node % inputs.len()];
                    graph.unlink(node).unwrap();
                    prop_assert_eq!(graph.link_of(node), None);
                }
                Edit::Pads { unit, pads } => {
                    let unit = resizable[unit];
                    graph.set_pad_count(unit, Side::Input, pads).unwrap();
                    prop_assert_eq!(graph.unit(unit).unwrap().pads(Side::Input), pads);
                }
            }
            check_invariants(&graph, &units)?;
        }
    }
}
