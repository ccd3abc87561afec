//! End-to-end scenarios exercising the graph, executor, and installer
//! together against real files and real subprocesses rather than mocks.

use build_graph_core::{
    command::{Command, CommonFields, ProcessCommand},
    graph::{ArtifactData, ArtifactKind, BuildGraph, Node, ProductId, Transformer},
    loader,
    product::ProductGraph,
    project_util::ScratchRoot,
    BuildError, Executor, ExecutorConfig, Installer, InstallerConfig, InstallArtifact, NullProgressObserver,
    TracingLogSink,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn cp_command(src: &std::path::Path, dst: &std::path::Path) -> ProcessCommand {
    ProcessCommand {
        program: "/bin/cp".into(),
        arguments: vec![src.display().to_string(), dst.display().to_string()],
        max_exit_code: 0,
        ..Default::default()
    }
}

/// S1: connecting `a.o -> b.o` then `b.o -> a.o` must be rejected as a
/// cycle.
#[test]
fn s1_cycle_is_rejected() {
    init_tracing();
    let mut graph = BuildGraph::new();
    let p = ProductId(0);
    graph.add_product(p);
    let a = graph.add_artifact(ArtifactData::new("a.o".into(), ArtifactKind::Source, p));
    let b = graph.add_artifact(ArtifactData::new("b.o".into(), ArtifactKind::Source, p));

    graph.connect(a, b).unwrap();
    let err = graph.connect(b, a).unwrap_err();
    assert!(matches!(err, BuildError::CycleIntroduced { .. }));
}

/// S2: an up-to-date output is rebuilt with zero process invocations.
#[test]
fn s2_incremental_no_op() {
    init_tracing();
    let root = ScratchRoot::new().unwrap();
    let in_path = root.write_file("in.txt", b"hello").unwrap();
    let out_path = root.write_file("out.txt", b"hello").unwrap();

    let p = ProductId(0);
    let mut graph = BuildGraph::new();
    graph.add_product(p);
    let input = graph.add_artifact(ArtifactData::new(in_path.clone(), ArtifactKind::Source, p));
    let mut output_data = ArtifactData::new(out_path.clone(), ArtifactKind::Generated, p);
    output_data.always_updated = true;
    let output = graph.add_artifact(output_data);
    graph.connect(output, input).unwrap();
    graph.set_timestamp(input, Some(100));
    graph.set_timestamp(output, Some(200));

    let mut transformer = Transformer::new("copy", vec![Command::Process(cp_command(&in_path, &out_path))]);
    transformer.inputs.push(input);
    transformer.outputs.push(output);
    let tid = graph.add_transformer(transformer);
    if let Some(Node::Artifact(a)) = graph.node_mut(output) {
        a.producing_transformer = Some(tid);
    }

    let mut products = ProductGraph::new();
    products.add_product(p);
    let mut executor = Executor::new(graph, &products, ExecutorConfig::default());
    let report = executor.build(&NullProgressObserver, &TracingLogSink);

    assert!(report.is_success());
    assert_eq!(report.commands_run, 0);
}

/// S3: bumping the source's recorded timestamp past the output's forces
/// exactly one invocation, and the output's timestamp is refreshed from
/// disk afterward.
#[test]
fn s3_source_changed_triggers_one_rebuild() {
    init_tracing();
    let root = ScratchRoot::new().unwrap();
    let in_path = root.write_file("in.txt", b"hello").unwrap();
    let out_path = root.join("out.txt");

    let p = ProductId(0);
    let mut graph = BuildGraph::new();
    graph.add_product(p);
    let input = graph.add_artifact(ArtifactData::new(in_path.clone(), ArtifactKind::Source, p));
    let mut output_data = ArtifactData::new(out_path.clone(), ArtifactKind::Generated, p);
    output_data.always_updated = true;
    let output = graph.add_artifact(output_data);
    graph.connect(output, input).unwrap();
    graph.set_timestamp(input, Some(300));
    graph.set_timestamp(output, Some(200));

    let mut transformer = Transformer::new("copy", vec![Command::Process(cp_command(&in_path, &out_path))]);
    transformer.inputs.push(input);
    transformer.outputs.push(output);
    let tid = graph.add_transformer(transformer);
    if let Some(Node::Artifact(a)) = graph.node_mut(output) {
        a.producing_transformer = Some(tid);
    }

    let mut products = ProductGraph::new();
    products.add_product(p);
    let mut executor = Executor::new(graph, &products, ExecutorConfig::default());
    let report = executor.build(&NullProgressObserver, &TracingLogSink);

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.commands_run, 1);
    assert!(out_path.exists());
    assert_eq!(std::fs::read(&out_path).unwrap(), b"hello");

    let final_graph = executor.into_graph();
    let new_ts = final_graph.timestamp_of(output).unwrap();
    assert!(new_ts > 0);
}

/// S4: an independent failing transformer and a succeeding one, under
/// both keep-going settings.
#[test]
fn s4_keep_going_runs_the_other_transformer() {
    init_tracing();
    let p = ProductId(0);
    let mut graph = BuildGraph::new();
    graph.add_product(p);

    let failing_output = graph.add_artifact(ArtifactData::new("fail.out".into(), ArtifactKind::Generated, p));
    if let Some(Node::Artifact(a)) = graph.node_mut(failing_output) {
        a.always_updated = true;
    }
    let mut failing_transformer = Transformer::new(
        "fail",
        vec![Command::Process(ProcessCommand {
            program: "/bin/sh".into(),
            arguments: vec!["-c".into(), "exit 2".into()],
            max_exit_code: 0,
            common: CommonFields { silent: true, ..Default::default() },
            ..Default::default()
        })],
    );
    failing_transformer.outputs.push(failing_output);
    let failing_tid = graph.add_transformer(failing_transformer);
    if let Some(Node::Artifact(a)) = graph.node_mut(failing_output) {
        a.producing_transformer = Some(failing_tid);
    }

    let succeeding_output = graph.add_artifact(ArtifactData::new("ok.out".into(), ArtifactKind::Generated, p));
    if let Some(Node::Artifact(a)) = graph.node_mut(succeeding_output) {
        a.always_updated = true;
    }
    let mut succeeding_transformer = Transformer::new(
        "ok",
        vec![Command::Process(ProcessCommand {
            program: "/bin/true".into(),
            max_exit_code: 0,
            common: CommonFields { silent: true, ..Default::default() },
            ..Default::default()
        })],
    );
    succeeding_transformer.outputs.push(succeeding_output);
    let succeeding_tid = graph.add_transformer(succeeding_transformer);
    if let Some(Node::Artifact(a)) = graph.node_mut(succeeding_output) {
        a.producing_transformer = Some(succeeding_tid);
    }

    let mut products = ProductGraph::new();
    products.add_product(p);

    let keep_going_false = graph.clone();
    let mut executor = Executor::new(keep_going_false, &products, ExecutorConfig { keep_going: false, ..Default::default() });
    let report = executor.build(&NullProgressObserver, &TracingLogSink);
    assert!(!report.is_success());
    assert_eq!(report.errors.len(), 1);

    let mut executor = Executor::new(graph, &products, ExecutorConfig { keep_going: true, ..Default::default() });
    let report = executor.build(&NullProgressObserver, &TracingLogSink);
    assert!(!report.is_success());
    assert_eq!(report.errors.len(), 1);
    let final_graph = executor.into_graph();
    assert!(final_graph.timestamp_of(succeeding_output).is_some());
}

/// S5: two distinct sources targeting the same install path conflict.
#[test]
fn s5_install_conflict() {
    init_tracing();
    let root = ScratchRoot::new().unwrap();
    root.write_file("b/a.out", b"one").unwrap();
    root.write_file("b/lib/a.out", b"two").unwrap();

    let installer = Installer::new(InstallerConfig {
        install_root: root.join("root"),
        dry_run: true,
        ..Default::default()
    });

    let artifacts = vec![
        InstallArtifact {
            source: root.join("b/a.out"),
            install_prefix: std::path::PathBuf::new(),
            install_dir: "bin".into(),
            source_relative_to_install_base: None,
        },
        InstallArtifact {
            source: root.join("b/lib/a.out"),
            install_prefix: std::path::PathBuf::new(),
            install_dir: "bin".into(),
            source_relative_to_install_base: None,
        },
    ];

    let err = installer.install(&artifacts).unwrap_err();
    assert!(matches!(err, BuildError::InstallConflict { .. }));
}

/// S6: after a first build, mutating the persisted command's program
/// defeats the rescue oracle; the stale output is deleted and the
/// transformer must run again.
#[test]
fn s6_rescue_miss_deletes_stale_output_and_rebuilds() {
    init_tracing();
    let root = ScratchRoot::new().unwrap();
    let in_path = root.write_file("in.txt", b"hello").unwrap();
    let out_path = root.join("out.txt");
    let graph_path = root.join("graph.json");

    let p = ProductId(0);

    // First build: a `cp` transformer produces out.txt.
    let mut old_graph = BuildGraph::new();
    old_graph.add_product(p);
    let old_input = old_graph.add_artifact(ArtifactData::new(in_path.clone(), ArtifactKind::Source, p));
    let mut old_output_data = ArtifactData::new(out_path.clone(), ArtifactKind::Generated, p);
    old_output_data.always_updated = true;
    let old_output = old_graph.add_artifact(old_output_data);
    old_graph.connect(old_output, old_input).unwrap();
    old_graph.set_timestamp(old_input, Some(100));

    let mut old_transformer = Transformer::new("copy", vec![Command::Process(cp_command(&in_path, &out_path))]);
    old_transformer.inputs.push(old_input);
    old_transformer.outputs.push(old_output);
    let old_tid = old_graph.add_transformer(old_transformer);
    if let Some(Node::Artifact(a)) = old_graph.node_mut(old_output) {
        a.producing_transformer = Some(old_tid);
    }

    let mut products = ProductGraph::new();
    products.add_product(p);
    let mut executor = Executor::new(old_graph, &products, ExecutorConfig::default());
    let report = executor.build(&NullProgressObserver, &TracingLogSink);
    assert!(report.is_success(), "{:?}", report.errors);
    assert!(out_path.exists());

    let built_graph = executor.into_graph();
    built_graph.save(&graph_path).unwrap();

    // Second resolve: the rule's command now reads `mv` instead of `cp`,
    // breaking the structural-equality rescue oracle.
    let mut new_graph = BuildGraph::new();
    new_graph.add_product(p);
    let new_input = new_graph.add_artifact(ArtifactData::new(in_path.clone(), ArtifactKind::Source, p));
    let mut new_output_data = ArtifactData::new(out_path.clone(), ArtifactKind::Generated, p);
    new_output_data.always_updated = true;
    let new_output = new_graph.add_artifact(new_output_data);
    new_graph.connect(new_output, new_input).unwrap();

    let mut new_transformer = Transformer::new(
        "move",
        vec![Command::Process(ProcessCommand {
            program: "/bin/mv".into(),
            arguments: vec![in_path.display().to_string(), out_path.display().to_string()],
            max_exit_code: 0,
            ..Default::default()
        })],
    );
    new_transformer.inputs.push(new_input);
    new_transformer.outputs.push(new_output);
    let new_tid = new_graph.add_transformer(new_transformer);
    if let Some(Node::Artifact(a)) = new_graph.node_mut(new_output) {
        a.producing_transformer = Some(new_tid);
    }

    let outcome = loader::load(&graph_path, &mut new_graph).unwrap();
    match outcome {
        loader::LoadOutcome::Loaded { rescue_report, .. } => {
            assert!(rescue_report.rescued.is_empty());
            assert_eq!(rescue_report.deleted_files, vec![out_path.clone()]);
        }
        loader::LoadOutcome::NoPersistedGraph => panic!("expected a persisted graph to be found"),
    }
    assert!(!out_path.exists());
    assert_eq!(new_graph.timestamp_of(new_output), None);
}
