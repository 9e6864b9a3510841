mod common;

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use ccs_conjoint::{ModelVariant, PosteriorArchive, RunConfig};
use tempfile::tempdir;

fn conjoint(args: &[&str], paths: &[(&str, &PathBuf)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_conjoint"));
    cmd.args(args).env("RUST_LOG", "warn");
    for (flag, path) in paths {
        cmd.arg(flag).arg(path);
    }
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "conjoint {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn write_inputs(dir: &Path, variant: ModelVariant) -> (PathBuf, PathBuf) {
    let input = dir.join("survey.csv");
    std::fs::write(&input, common::survey_csv(8, 3, 21)).unwrap();
    let config = dir.join("config.json");
    std::fs::write(&config, common::quick_config(variant).to_json_pretty().unwrap()).unwrap();
    (input, config)
}

#[test]
fn default_config_round_trips() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("defaults.json");
    conjoint(&["default-config"], &[("--out", &out)]);

    let parsed = RunConfig::from_path(&out).unwrap();
    assert_eq!(parsed, RunConfig::default());

    let printed = conjoint(&["default-config"], &[]);
    let from_stdout: RunConfig = serde_json::from_slice(&printed.stdout).unwrap();
    assert_eq!(from_stdout, RunConfig::default());
}

#[test]
fn levels_lists_baseline_first() {
    let dir = tempdir().unwrap();
    let (input, config) = write_inputs(dir.path(), ModelVariant::Basic);
    let output = conjoint(&["levels"], &[("--input", &input), ("--config", &config)]);
    let stdout = String::from_utf8(output.stdout).unwrap();

    let mut lines = stdout.lines();
    assert_eq!(lines.next(), Some("0\tattr_costs_taxpayer\tattr_costs\ttaxpayer"));
    assert!(stdout.lines().any(|l| l.ends_with("\tattr_vicinity\tabroad")));
    let fingerprint = stdout.lines().last().unwrap();
    assert!(fingerprint.starts_with("fingerprint\t"));
    assert_eq!(fingerprint.len(), "fingerprint\t".len() + 64);
}

#[test]
fn prior_check_writes_summaries() {
    let dir = tempdir().unwrap();
    let (input, config) = write_inputs(dir.path(), ModelVariant::Basic);
    let out = dir.path().join("prior.json");
    let output = conjoint(
        &["prior-check", "--samples", "40"],
        &[("--input", &input), ("--config", &config), ("--out", &out)],
    );
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("beta[attr_costs_taxpayer]"));
    assert!(stdout.contains("simulated left-choice rate"));

    let raw = std::fs::read_to_string(&out).unwrap();
    let summaries: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
    assert!(summaries.iter().any(|s| s["variable"] == "gamma"));
}

#[test]
fn fit_then_summarize() {
    let dir = tempdir().unwrap();
    let (input, config) = write_inputs(dir.path(), ModelVariant::Hybrid);
    let archive_path = dir.path().join("inference_hybrid_choice.json");
    conjoint(
        &["fit", "--skip-advi", "--chains", "2", "--tune", "80", "--draws", "40"],
        &[("--input", &input), ("--config", &config), ("--out", &archive_path)],
    );

    let archive = PosteriorArchive::read(&archive_path).unwrap();
    assert_eq!(archive.model.variant, ModelVariant::Hybrid);
    assert!(archive.advi.is_none());
    assert_eq!(archive.posterior.chains, 2);
    assert_eq!(archive.posterior.draws, 40);
    assert_eq!(archive.get("lreco").unwrap().shape, vec![8]);
    assert_eq!(archive.draw("theta_lreco", 1, 39).unwrap().len(), archive.get("beta").unwrap().shape[0]);

    let output = conjoint(&["summarize", "--var", "beta,theta_lreco"], &[("--archive", &archive_path)]);
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("theta_lreco[attr_costs_taxpayer]"));
    assert!(stdout.contains("chains=2 draws=40"));
}

#[test]
fn summarize_rejects_unknown_variable() {
    let dir = tempdir().unwrap();
    let (input, config) = write_inputs(dir.path(), ModelVariant::Basic);
    let archive_path = dir.path().join("archive.json");
    conjoint(
        &["fit", "--skip-advi", "--chains", "1", "--tune", "40", "--draws", "20"],
        &[("--input", &input), ("--config", &config), ("--out", &archive_path)],
    );

    let status = Command::new(env!("CARGO_BIN_EXE_conjoint"))
        .args(["summarize", "--var", "nope"])
        .arg("--archive")
        .arg(&archive_path)
        .env("RUST_LOG", "warn")
        .status()
        .unwrap();
    assert!(!status.success());
}
