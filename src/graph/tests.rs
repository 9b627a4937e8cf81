use std::sync::Arc;

use super::operator::lock;
use super::*;
use crate::test_utils::{CallLog, Event, Recorder};

fn output(graph: &Graph, unit: UnitKey, line: usize) -> NodeKey {
    graph.unit(unit).unwrap().outputs()[line]
}
fn input(graph: &Graph, unit: UnitKey, line: usize) -> NodeKey {
    graph.unit(unit).unwrap().inputs()[line]
}
fn top_of(graph: &Graph, root: RunInstanceKey) -> RunGroupKey {
    graph.run_instance(root).unwrap().group()
}
fn recorder_template(name: &str, log: &CallLog) -> Operator {
    Operator::template(Recorder::new(name, log))
}
/// Operator, stage pairs of every run call, in order
fn runs(log: &CallLog) -> Vec<(String, Stage)> {
    log.calls()
        .into_iter()
        .filter_map(|c| match c.event {
            Event::Run(stage) => Some((c.operator, stage)),
            _ => None,
        })
        .collect()
}

#[test]
fn sync_unlink_drops_downstream_instances() {
    let mut graph = Graph::default();
    let a = graph.add_unit(
        UnitSettings::default()
            .name("a")
            .input_pads(2)
            .output_pads(2),
    );
    let b = graph.add_unit(UnitSettings::default().name("b"));
    let a_out = output(&graph, a, 0);
    let b_in = input(&graph, b, 0);
    graph.set_link(a_out, Some(b_in)).unwrap();
    let root = graph.start_playback(a_out, Purpose::PLAYBACK).unwrap();
    assert_eq!(graph.run_instance(root).unwrap().holder(), Holder::Node(a_out));
    // Four nodes and two units, the second line of A is not part of the play
    assert_eq!(graph.num_run_instances(), 6);
    assert_eq!(graph.num_run_groups(), 1);
    assert!(graph.run_instances_of(output(&graph, a, 1)).is_empty());
    assert!(graph.run_instances_of(input(&graph, a, 1)).is_empty());
    let a_in = input(&graph, a, 0);
    let upstream: Vec<_> = [Holder::Node(a_out), Holder::Node(a_in), Holder::Unit(a)]
        .into_iter()
        .map(|holder| {
            let key = graph.run_instances_of(holder)[0];
            (key, graph.run_instance(key).unwrap().state().clone())
        })
        .collect();

    let report = graph.set_link(b_in, None).unwrap();
    assert_eq!(report.invalidated.len(), 3);
    assert!(report.created.is_empty());
    assert_eq!(graph.num_run_instances(), 3);
    assert!(graph.run_instances_of(b_in).is_empty());
    assert!(graph.run_instances_of(output(&graph, b, 0)).is_empty());
    assert!(graph.run_instances_of(b).is_empty());
    assert!(graph.link_of(a_out).is_none());
    assert!(graph.link_of(b_in).is_none());
    for (key, state) in &upstream {
        assert!(Arc::ptr_eq(graph.run_instance(*key).unwrap().state(), state));
    }
    assert!(graph.run_instances_of(output(&graph, a, 1)).is_empty());

    let report = graph.set_link(a_out, Some(b_in)).unwrap();
    assert_eq!(report.created.len(), 3);
    assert_eq!(graph.num_run_instances(), 6);
}

#[test]
fn owned_input_pads_get_a_child_group_each() {
    let log = CallLog::new();
    let mut graph = Graph::default();
    let c = graph.add_unit(
        UnitSettings::default()
            .name("c")
            .flags(UnitFlags::ASYNC | UnitFlags::OWNS_INPUT_RECYCLING)
            .input_pads(3),
    );
    assert_eq!(graph.num_sub_buffers(), 3);
    let c_out = output(&graph, c, 0);
    let range = graph.node(c_out).unwrap().range().unwrap();
    assert_eq!(graph.range_len(range), 3);
    assert!(graph.is_well_formed(range));
    for pad in 0..3 {
        let pad_input = input(&graph, c, pad);
        graph.add_template(pad_input, recorder_template("child", &log)).unwrap();
    }
    graph.add_template(c, recorder_template("unit", &log)).unwrap();

    let root = graph.start_playback(c_out, Purpose::PLAYBACK).unwrap();
    let top = top_of(&graph, root);
    let group = graph.run_group(top).unwrap();
    assert_eq!(group.members().len(), 3);
    assert_eq!(group.children().len(), 3);
    for (pad, child_key) in group.children().iter().enumerate() {
        let pad_input = input(&graph, c, pad);
        let own = graph.node(pad_input).unwrap().own_sub_buffer().unwrap();
        let child = graph.run_group(*child_key).unwrap();
        assert_eq!(child.members(), &[own]);
        assert_eq!(child.parent(), Some(top));
        assert!(graph.find_instance_in_group(pad_input, *child_key).is_some());
        assert_eq!(graph.position(range, own), Some(pad));
    }
    // Output, unit and three inputs
    assert_eq!(graph.num_run_instances(), 5);
    assert_eq!(graph.child_instances(root).len(), 3);

    // Every child group runs once, the unit after all of them
    graph.run_stage(root, Stage::Pre).unwrap();
    let pre: Vec<_> = runs(&log)
        .into_iter()
        .filter(|(_, stage)| *stage == Stage::Pre)
        .map(|(name, _)| name)
        .collect();
    assert_eq!(pre, ["child", "child", "child", "unit"]);
    let child_groups: Vec<_> = log
        .filter(&Event::Run(Stage::Pre))
        .iter()
        .filter(|call| call.operator == "child")
        .map(|call| graph.run_instance(call.run_instance.unwrap()).unwrap().group())
        .collect();
    assert_eq!(child_groups, graph.run_group(top).unwrap().children());
}

#[test]
fn private_input_buffer_follows_linked_output() {
    let mut graph = Graph::default();
    let s = graph.add_unit(
        UnitSettings::default()
            .name("s")
            .flags(UnitFlags::OWNS_OUTPUT_RECYCLING),
    );
    let c = graph.add_unit(
        UnitSettings::default()
            .name("c")
            .flags(UnitFlags::ASYNC | UnitFlags::OWNS_INPUT_RECYCLING)
            .input_pads(3),
    );
    let s_out = output(&graph, s, 0);
    let c_in1 = input(&graph, c, 1);
    let c_out = output(&graph, c, 0);
    let root = graph.start_playback(c_out, Purpose::PLAYBACK).unwrap();
    assert_eq!(graph.num_run_groups(), 4);

    let report = graph.set_link(s_out, Some(c_in1)).unwrap();
    let private = graph.node(c_in1).unwrap().own_sub_buffer().unwrap();
    let s_buffer = graph.node(s_out).unwrap().own_sub_buffer().unwrap();
    assert_eq!(graph.sub_buffer(private).unwrap().parent(), Some(s_buffer));
    // The owned input keeps its own range
    assert_eq!(
        graph.node(c_in1).unwrap().range(),
        Some(SubBufferRange::single(private))
    );
    // s is reached below the pad group and nests one level further
    assert_eq!(report.created.len(), 3);
    assert_eq!(graph.num_run_groups(), 5);
    let pad_group = graph
        .find_child_group(top_of(&graph, root), private)
        .unwrap();
    let s_group = graph.find_child_group(pad_group, s_buffer).unwrap();
    assert!(graph.find_instance_in_group(s_out, s_group).is_some());
    assert!(graph.find_instance_in_group(s, s_group).is_some());
    // Unit level lookups reach the closest ancestor
    assert_eq!(
        graph.find_instance_in_parent_group(c, s_group),
        graph.find_instance_in_group(c, top_of(&graph, root))
    );

    graph.set_link(c_in1, None).unwrap();
    assert_eq!(graph.sub_buffer(private).unwrap().parent(), None);
    assert_eq!(graph.num_run_groups(), 4);
}

#[test]
fn owned_output_below_the_origin_nests() {
    let mut graph = Graph::default();
    let s = graph.add_unit(UnitSettings::default().flags(UnitFlags::OWNS_OUTPUT_RECYCLING));
    let m = graph.add_unit(UnitSettings::default().flags(UnitFlags::ASYNC));
    let s_out = output(&graph, s, 0);
    let m_in = input(&graph, m, 0);
    let m_out = output(&graph, m, 0);
    graph.set_link(s_out, Some(m_in)).unwrap();
    let s_range = graph.node(s_out).unwrap().range();
    assert_eq!(graph.node(m_in).unwrap().range(), s_range);
    assert_eq!(graph.node(m_out).unwrap().range(), s_range);

    let root = graph.start_playback(m_out, Purpose::PLAYBACK).unwrap();
    let top = top_of(&graph, root);
    assert_eq!(graph.num_run_groups(), 2);
    let child = graph.run_group(top).unwrap().children()[0];
    assert!(graph.find_instance_in_group(s_out, child).is_some());
    assert!(graph.find_instance_in_group(m_in, top).is_some());
}

#[test]
fn loops_are_refused_without_changes() {
    let mut graph = Graph::default();
    let a = graph.add_unit(UnitSettings::default().name("a"));
    let b = graph.add_unit(UnitSettings::default().name("b"));
    let a_out = output(&graph, a, 0);
    let a_in = input(&graph, a, 0);
    let b_out = output(&graph, b, 0);
    let b_in = input(&graph, b, 0);
    graph.set_link(a_out, Some(b_in)).unwrap();
    let before = graph.generate_inspection();

    assert_eq!(graph.set_link(b_out, Some(a_in)), Err(LinkError::LoopInLink));
    assert_eq!(graph.generate_inspection(), before);
    assert_eq!(graph.set_link(a_out, Some(a_in)), Err(LinkError::LoopInLink));
    assert_eq!(graph.generate_inspection(), before);
    assert_eq!(
        graph.set_link(a_out, Some(b_out)),
        Err(LinkError::SameSide(Side::Output))
    );
    assert!(graph.would_loop(b_out, a_in));
    assert!(!graph.would_loop(a_out, b_in));
}

#[test]
fn relinking_detaches_old_partners() {
    let mut graph = Graph::default();
    let a = graph.add_unit(UnitSettings::default());
    let b = graph.add_unit(UnitSettings::default());
    let c = graph.add_unit(UnitSettings::default());
    let a_out = output(&graph, a, 0);
    let b_in = input(&graph, b, 0);
    let c_in = input(&graph, c, 0);
    graph.set_link(a_out, Some(b_in)).unwrap();
    graph.set_link(c_in, Some(a_out)).unwrap();
    assert_eq!(graph.link_of(a_out), Some(c_in));
    assert_eq!(graph.link_of(c_in), Some(a_out));
    assert_eq!(graph.link_of(b_in), None);
    // Same link again is a no-op
    assert!(graph.set_link(a_out, Some(c_in)).unwrap().is_empty());
}

#[test]
fn templates_are_cloned_once_per_run_instance() {
    let log = CallLog::new();
    let mut graph = Graph::default();
    let a = graph.add_unit(UnitSettings::default());
    graph.add_template(a, recorder_template("a", &log)).unwrap();
    graph
        .add_template(
            a,
            recorder_template("notation", &log).purposes(Purpose::NOTATION),
        )
        .unwrap();
    let a_out = output(&graph, a, 0);
    let root = graph.start_playback(a_out, Purpose::PLAYBACK).unwrap();
    let unit_instance = graph
        .find_instance_in_group(a, top_of(&graph, root))
        .unwrap();
    assert_eq!(log.count("a", &Event::Duplicate), 1);
    assert_eq!(log.count("notation", &Event::Duplicate), 0);

    assert_eq!(graph.duplicate(a, Purpose::PLAYBACK, unit_instance).unwrap(), 0);
    assert_eq!(log.count("a", &Event::Duplicate), 1);
    let clones = graph.operators(a, unit_instance);
    assert_eq!(clones.len(), 1);
    let clone = lock(&clones[0]);
    assert!(!clone.is_template());
    assert!(!clone.is_hidden());
    assert_eq!(clone.lifecycle(), Lifecycle::RunInitialized);
    assert_eq!(clone.run_instance(), Some(unit_instance));
}

#[test]
fn shared_operators_are_never_cloned() {
    let log = CallLog::new();
    let mut graph = Graph::default();
    let a = graph.add_unit(UnitSettings::default());
    graph
        .add_template(a, Operator::shared(Recorder::new("table", &log)))
        .unwrap();
    graph
        .add_template(
            a,
            Operator::template(
                Recorder::new("reader", &log)
                    .depends_on(Dependency::new("table", DependencyScope::Holder)),
            ),
        )
        .unwrap();
    let root = graph
        .start_playback(output(&graph, a, 0), Purpose::PLAYBACK)
        .unwrap();
    assert_eq!(log.count("table", &Event::Duplicate), 0);
    assert_eq!(
        log.filter(&Event::Resolve(vec![("table".to_string(), true)]))
            .len(),
        1
    );
    graph.run_period(root).unwrap();
    assert!(runs(&log).iter().all(|(name, _)| name != "table"));
}

#[test]
fn stages_run_leaves_first_and_in_order() {
    let log = CallLog::new();
    let mut graph = Graph::default();
    let u = graph.add_unit(UnitSettings::default().name("u"));
    let a = graph.add_unit(UnitSettings::default().name("a"));
    let u_out = output(&graph, u, 0);
    let a_in = input(&graph, a, 0);
    let a_out = output(&graph, a, 0);
    graph.set_link(u_out, Some(a_in)).unwrap();
    graph.add_template(u, recorder_template("u", &log)).unwrap();
    graph.add_template(a_in, recorder_template("a_in", &log)).unwrap();
    graph.add_template(a, recorder_template("a_unit", &log)).unwrap();
    graph.add_template(a_out, recorder_template("a_out", &log)).unwrap();

    let root = graph.start_playback(a_out, Purpose::PLAYBACK).unwrap();
    let calls = log.calls();
    let last_resolve = calls
        .iter()
        .rposition(|c| matches!(c.event, Event::Resolve(_)))
        .unwrap();
    let first_init = calls
        .iter()
        .position(|c| matches!(c.event, Event::RunInit(_)))
        .unwrap();
    assert!(last_resolve < first_init);
    let pre_inits: Vec<String> = log
        .filter(&Event::RunInit(Stage::Pre))
        .into_iter()
        .map(|c| c.operator)
        .collect();
    assert_eq!(pre_inits, ["u", "a_in", "a_unit", "a_out"]);

    graph.run_period(root).unwrap();
    let mut expected = vec![];
    for stage in Stage::ALL {
        for name in ["u", "a_in", "a_unit", "a_out"] {
            expected.push((name.to_string(), stage));
        }
    }
    assert_eq!(runs(&log), expected);
}

#[test]
fn async_output_runs_once_per_stage() {
    let log = CallLog::new();
    let mut graph = Graph::default();
    let m = graph.add_unit(
        UnitSettings::default()
            .name("mixer")
            .flags(UnitFlags::ASYNC)
            .input_pads(2),
    );
    let s1 = graph.add_unit(UnitSettings::default());
    let s2 = graph.add_unit(UnitSettings::default());
    let (s1_out, s2_out) = (output(&graph, s1, 0), output(&graph, s2, 0));
    graph.set_link(s1_out, Some(input(&graph, m, 0))).unwrap();
    graph.set_link(s2_out, Some(input(&graph, m, 1))).unwrap();
    let m_out = output(&graph, m, 0);
    graph.add_template(m_out, recorder_template("m", &log)).unwrap();
    graph.add_template(s1, recorder_template("s", &log)).unwrap();
    graph.add_template(s2, recorder_template("s", &log)).unwrap();
    let root = graph.start_playback(m_out, Purpose::PLAYBACK).unwrap();

    let plan = StageRunner::default().plan(&graph, root).unwrap();
    plan.run_period();
    assert_eq!(log.count("m", &Event::Run(Stage::Inter)), 1);
    assert_eq!(log.count("s", &Event::Run(Stage::Inter)), 2);
    // Already claimed this period
    plan.run_stage(Stage::Inter);
    assert_eq!(log.count("m", &Event::Run(Stage::Inter)), 1);

    let parallel = StageRunner::new(true).plan(&graph, root).unwrap();
    assert_eq!(parallel.len(), plan.len());
    parallel.run_period();
    assert_eq!(log.count("m", &Event::Run(Stage::Inter)), 2);
    assert_eq!(log.count("s", &Event::Run(Stage::Inter)), 4);
    // The mixer runs after both of its sources in every stage
    let order = runs(&log);
    let last_m = order.iter().rposition(|(n, s)| n == "m" && *s == Stage::Post);
    let last_s = order.iter().rposition(|(n, s)| n == "s" && *s == Stage::Post);
    assert!(last_s < last_m);
}

#[test]
fn edits_leave_other_plays_alone() {
    let mut graph = Graph::default();
    let a = graph.add_unit(UnitSettings::default());
    let b = graph.add_unit(UnitSettings::default());
    let c = graph.add_unit(UnitSettings::default());
    let a_out = output(&graph, a, 0);
    graph.set_link(a_out, Some(input(&graph, b, 0))).unwrap();
    let p1 = graph.start_playback(a_out, Purpose::PLAYBACK).unwrap();
    let p2 = graph
        .start_playback(output(&graph, c, 0), Purpose::PLAYBACK)
        .unwrap();
    let p2_instances = graph.instances_of_play(top_of(&graph, p2));
    assert_eq!(graph.playbacks().len(), 2);

    graph.run_stage(p1, Stage::Pre).unwrap();
    let state = graph.run_instance(p1).unwrap().state().clone();
    assert!(state.is_claimed(Stage::Pre));

    graph.set_link(a_out, None).unwrap();
    assert_eq!(graph.instances_of_play(top_of(&graph, p2)), p2_instances);
    // Surviving instances keep identity and stage flags
    assert!(Arc::ptr_eq(graph.run_instance(p1).unwrap().state(), &state));
    assert!(state.is_claimed(Stage::Pre));
    assert!(!state.is_claimed(Stage::Inter));
}

#[test]
fn set_range_with_the_same_range_is_a_no_op() {
    let mut graph = Graph::default();
    let s = graph.add_unit(UnitSettings::default().flags(UnitFlags::OWNS_OUTPUT_RECYCLING));
    let m = graph.add_unit(UnitSettings::default());
    let s_out = output(&graph, s, 0);
    let m_in = input(&graph, m, 0);
    let m_out = output(&graph, m, 0);
    graph.take_range_changes();
    graph.set_link(s_out, Some(m_in)).unwrap();

    let s_range = graph.node(s_out).unwrap().range();
    let changes = graph.take_range_changes();
    assert!(changes.iter().any(|c| c.node == m_in && c.new == s_range));
    assert!(changes.iter().any(|c| c.node == m_out && c.new == s_range));

    assert_eq!(graph.set_range(m_in, s_range, false, false), Ok(false));
    assert!(graph.take_range_changes().is_empty());
    assert_eq!(graph.node(m_out).unwrap().range(), s_range);

    graph.set_link(m_in, None).unwrap();
    assert_eq!(graph.node(m_in).unwrap().range(), None);
    assert_eq!(graph.node(m_out).unwrap().range(), None);
    assert!(graph.sub_buffer(s_range.unwrap().first).is_some());
}

#[test]
fn pad_count_changes_follow_through_to_plays() {
    let mut graph = Graph::default();
    let c = graph.add_unit(
        UnitSettings::default()
            .flags(UnitFlags::ASYNC | UnitFlags::OWNS_INPUT_RECYCLING)
            .input_pads(3),
    );
    let c_out = output(&graph, c, 0);
    let root = graph.start_playback(c_out, Purpose::PLAYBACK).unwrap();
    let top = top_of(&graph, root);

    graph.set_pad_count(c, Side::Input, 2).unwrap();
    assert_eq!(graph.num_sub_buffers(), 2);
    let range = graph.node(c_out).unwrap().range().unwrap();
    assert_eq!(graph.range_len(range), 2);
    assert!(graph.is_well_formed(range));
    assert_eq!(graph.run_group(top).unwrap().members().len(), 2);
    assert_eq!(graph.run_group(top).unwrap().children().len(), 2);
    assert_eq!(graph.num_run_instances(), 4);

    graph.set_pad_count(c, Side::Input, 4).unwrap();
    let range = graph.node(c_out).unwrap().range().unwrap();
    assert_eq!(graph.range_len(range), 4);
    assert!(graph.is_well_formed(range));
    assert_eq!(graph.run_group(top).unwrap().children().len(), 4);
    assert_eq!(graph.num_run_instances(), 6);
    let unit = graph.unit(c).unwrap();
    assert_eq!(unit.pad_last(Side::Input), Some(unit.inputs()[3]));
    assert_eq!(graph.last_with_recycling(c, Side::Input), Some(unit.inputs()[3]));
}

#[test]
fn removing_a_unit_removes_its_run_state() {
    let log = CallLog::new();
    let mut graph = Graph::default();
    let a = graph.add_unit(UnitSettings::default());
    let b = graph.add_unit(UnitSettings::default());
    graph.add_template(b, recorder_template("b", &log)).unwrap();
    let a_out = output(&graph, a, 0);
    graph.set_link(a_out, Some(input(&graph, b, 0))).unwrap();
    let root = graph.start_playback(a_out, Purpose::PLAYBACK).unwrap();
    assert_eq!(graph.num_run_instances(), 6);

    graph.remove_unit(b).unwrap();
    assert_eq!(graph.num_units(), 1);
    assert_eq!(graph.num_run_instances(), 3);
    assert!(graph.link_of(a_out).is_none());
    assert_eq!(log.count("b", &Event::Cancel), 1);
    assert_eq!(graph.sweep_retired(), 0);
    graph.run_period(root).unwrap();
    assert_eq!(log.count("b", &Event::Run(Stage::Pre)), 0);
}

#[test]
fn removing_the_origin_removes_the_play() {
    let mut graph = Graph::default();
    let a = graph.add_unit(UnitSettings::default());
    let root = graph
        .start_playback(output(&graph, a, 0), Purpose::PLAYBACK)
        .unwrap();
    graph.remove_unit(a).unwrap();
    assert_eq!(graph.num_run_instances(), 0);
    assert_eq!(graph.num_run_groups(), 0);
    assert_eq!(graph.run_period(root), Err(PlaybackError::RunInstanceNotFound));
}

#[test]
fn operators_with_pending_work_cannot_be_removed() {
    let log = CallLog::new();
    let mut graph = Graph::default();
    let a = graph.add_unit(UnitSettings::default());
    graph
        .add_template(a, Operator::template(Recorder::new("tail", &log).linger(2)))
        .unwrap();
    let root = graph
        .start_playback(output(&graph, a, 0), Purpose::PLAYBACK)
        .unwrap();
    let unit_instance = graph
        .find_instance_in_group(a, top_of(&graph, root))
        .unwrap();
    let clone_id = lock(&graph.operators(a, unit_instance)[0]).id();

    graph.cancel_playback(root).unwrap();
    assert!(!graph.is_playback_finished(root));
    assert_eq!(
        graph.remove(a, clone_id).unwrap_err(),
        OperatorError::PendingWork(clone_id)
    );

    graph.run_period(root).unwrap();
    assert!(!graph.is_playback_finished(root));
    graph.run_period(root).unwrap();
    assert!(graph.is_playback_finished(root));
    let done = graph.take_done_operators();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].operator, clone_id);
    assert!(graph.remove(a, clone_id).is_ok());

    // Finished instances are skipped from now on
    let before = runs(&log).len();
    graph.run_period(root).unwrap();
    assert_eq!(runs(&log).len(), before);
    graph.stop_playback(root).unwrap();
    assert_eq!(graph.num_run_groups(), 0);
}

#[test]
fn missing_dependencies_are_reported_but_do_not_stop_the_play() {
    let log = CallLog::new();
    let mut graph = Graph::default();
    let a = graph.add_unit(UnitSettings::default());
    let b = graph.add_unit(UnitSettings::default());
    let a_out = output(&graph, a, 0);
    let b_in = input(&graph, b, 0);
    graph.add_template(a, recorder_template("peer", &log)).unwrap();
    graph
        .add_template(
            a_out,
            Operator::template(
                Recorder::new("wants_peer", &log)
                    .depends_on(Dependency::new("peer", DependencyScope::Unit)),
            ),
        )
        .unwrap();
    graph
        .add_template(
            b_in,
            Operator::template(
                Recorder::new("lonely", &log)
                    .depends_on(Dependency::new("nobody", DependencyScope::Holder)),
            ),
        )
        .unwrap();
    let root = graph.start_playback(a_out, Purpose::PLAYBACK).unwrap();
    assert_eq!(
        log.filter(&Event::Resolve(vec![("peer".to_string(), true)]))
            .len(),
        1
    );

    let report = graph.set_link(a_out, Some(b_in)).unwrap();
    assert_eq!(
        report.unresolved,
        vec![OperatorError::UnresolvedDependency {
            operator: "lonely".to_string(),
            dependency: "nobody".to_string(),
        }]
    );
    graph.run_period(root).unwrap();
    assert_eq!(log.count("lonely", &Event::Run(Stage::Post)), 1);

    // Fresh clones report the same missing peer again
    let first = report.clone();
    graph.unlink(b_in).unwrap();
    let again = graph.set_link(a_out, Some(b_in)).unwrap();
    assert_eq!(again.unresolved, first.unresolved);
}

#[test]
fn plays_can_start_on_an_input() {
    let mut graph = Graph::default();
    let a = graph.add_unit(UnitSettings::default());
    let b = graph.add_unit(UnitSettings::default());
    let b_in = input(&graph, b, 0);
    graph.set_link(output(&graph, a, 0), Some(b_in)).unwrap();
    let root = graph.start_playback(b_in, Purpose::PLAYBACK).unwrap();
    assert_eq!(graph.num_run_instances(), 6);
    let plan = StageRunner::default().plan(&graph, root).unwrap();
    assert_eq!(plan.len(), 6);
    let b_out = output(&graph, b, 0);
    assert_eq!(
        plan.run_instances().last(),
        graph.run_instances_of(b_out).first()
    );
    assert_eq!(
        StageRunner::default()
            .plan(&graph, graph.run_instances_of(b)[0])
            .err(),
        Some(PlaybackError::NotARoot)
    );
}

#[test]
fn navigation_follows_pads_and_lines() {
    let mut graph = Graph::default();
    let u = graph.add_unit(
        UnitSettings::default()
            .flags(UnitFlags::ASYNC)
            .audio_channels(2)
            .input_pads(3),
    );
    let unit = graph.unit(u).unwrap();
    assert_eq!(unit.inputs().len(), 6);
    assert_eq!(unit.pads(Side::Input), 3);
    let second_pad = unit.pad_nth(Side::Input, 1).unwrap();
    let node = graph.node(second_pad).unwrap();
    assert_eq!((node.pad(), node.audio_channel(), node.line()), (1, 0, 2));
    assert_eq!(node.prev_pad(), unit.pad_first(Side::Input));
    assert_eq!(node.next(), unit.nth(Side::Input, 3));
    assert_eq!(graph.output_for(second_pad), unit.first(Side::Output));
    let right_channel_out = unit.nth(Side::Output, 1).unwrap();
    assert_eq!(graph.inputs_for(right_channel_out).len(), 3);
    // Only the first pad of an ASYNC unit collects the inputs
    assert_eq!(graph.inputs_for(unit.outputs()[0]).len(), 3);
}

#[test]
fn canceling_a_plan_winds_down_its_operators() {
    let log = CallLog::new();
    let mut graph = Graph::default();
    let a = graph.add_unit(UnitSettings::default());
    let b = graph.add_unit(UnitSettings::default());
    let a_out = output(&graph, a, 0);
    graph.set_link(a_out, Some(input(&graph, b, 0))).unwrap();
    graph
        .add_template(a, Operator::template(Recorder::new("quick", &log)))
        .unwrap();
    graph
        .add_template(b, Operator::template(Recorder::new("slow", &log).linger(1)))
        .unwrap();
    assert!(graph.find_operator(b, "slow").unwrap().lock().unwrap().is_template());
    let root = graph.start_playback(a_out, Purpose::PLAYBACK).unwrap();
    let plan = StageRunner::default().plan(&graph, root).unwrap();
    assert_eq!(plan.root(), root);

    assert_eq!(plan.cancel(), 1);
    assert!(!plan.is_finished());
    assert!(plan.states().iter().all(|s| s.is_canceled()));
    plan.run_period();
    assert!(plan.is_finished());
    assert_eq!(log.count("quick", &Event::Run(Stage::Post)), 0);
    assert_eq!(log.count("slow", &Event::Run(Stage::Post)), 1);
    // Both report done: one on cancel, one after winding down
    assert_eq!(graph.take_done_operators().len(), 2);
    assert!(graph.is_playback_finished(root));
}
