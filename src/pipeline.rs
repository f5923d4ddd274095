//! Proteomics Pipeline
//!
//! The six-stage pipeline shipped with the binary:
//!
//! ```text
//! raw/{dataset}.raw ──convert──▶ converted/{db}/{dataset}.mzML ─┐
//! databases/{db}.fasta ──index──▶ index/{db}/ ──────────────────┴─search─▶ search/{db}/{dataset}.pin
//!   ──format_convert──▶ search/{db}/{dataset}.tsv
//!   ──score──▶ score/{db}/{dataset}.psms.tsv
//!   ──aggregate──▶ results/{db}/{dataset}.summary.tsv
//! ```
//!
//! The index is built once per database and shared by every dataset.
//! `combine` gathers all dataset summaries of one database on request.

use std::sync::Arc;

use crate::error::Result;
use crate::workflow::{PipelineConfig, Rule, RuleRegistry};

/// Target template built when no targets are requested.
pub const DEFAULT_TARGET: &str = "results/{db}/{dataset}.summary.tsv";

/// FDR threshold applied when summarising scored PSMs.
const DEFAULT_FDR: &str = "0.01";

/// Declares the pipeline rules, resolving tool locations from `config`.
pub fn rules(config: &PipelineConfig) -> Vec<Rule> {
    let msconvert = config.tool("msconvert");
    let comet = config.tool("comet");
    let percolator = config.tool("percolator");

    vec![
        Rule::new(
            "convert",
            format!(
                "{} {{input.raw}} --mzML -o $(dirname {{output.mzml}}) --outfile $(basename {{output.mzml}})",
                msconvert
            ),
        )
        .with_input("raw", "raw/{dataset}.raw")
        .with_output("mzml", "converted/{db}/{dataset}.mzML")
        .with_log("logs/convert/{db}/{dataset}.log")
        .with_container("chambm/pwiz-skyline-i-agree-to-the-vendor-licenses"),
        Rule::new(
            "index",
            format!(
                "cp {{input.fasta}} {{output.index}}/{{wildcards.db}}.fasta && {} -i -D{{output.index}}/{{wildcards.db}}.fasta",
                comet
            ),
        )
        .with_input("fasta", "databases/{db}.fasta")
        .with_directory_output("index", "index/{db}", &["{db}.fasta.idx"])
        .with_log("logs/index/{db}.log")
        .with_conda_env("comet")
        .with_threads(4),
        Rule::new(
            "search",
            format!(
                "{} -P{{params.config}} -D{{input.index}}/{{wildcards.db}}.fasta.idx -N{{params.prefix}} {{input.spectra}} && mv {{params.prefix}}.pin {{output.pin}}",
                comet
            ),
        )
        .with_input("spectra", "converted/{db}/{dataset}.mzML")
        .with_input("index", "index/{db}")
        .with_output("pin", "search/{db}/{dataset}.pin")
        .with_log("logs/search/{db}/{dataset}.log")
        .with_param("config", "comet.params")
        .with_computed_param("prefix", |wildcards, _| {
            format!("search/{}/{}.comet", wildcards["db"], wildcards["dataset"])
        })
        .with_conda_env("comet")
        .with_threads(4),
        Rule::new(
            "format_convert",
            "awk 'BEGIN {{ FS = OFS = \"\\t\" }} NR == 1 || $1 !~ /^DefaultDirection/ {{ print }}' {input.pin} > {output.tsv}",
        )
        .with_input("pin", "search/{db}/{dataset}.pin")
        .with_output("tsv", "search/{db}/{dataset}.tsv")
        .with_log("logs/format_convert/{db}/{dataset}.log"),
        Rule::new(
            "score",
            format!(
                "{} --num-threads {{threads}} --results-psms {{output.psms}} {{input.tsv}}",
                percolator
            ),
        )
        .with_input("tsv", "search/{db}/{dataset}.tsv")
        .with_output("psms", "score/{db}/{dataset}.psms.tsv")
        .with_log("logs/score/{db}/{dataset}.log")
        .with_conda_env("percolator")
        .with_threads(2),
        Rule::new(
            "aggregate",
            "awk -v fdr={params.fdr} -v db={wildcards.db} -v ds={wildcards.dataset} 'BEGIN {{ FS = OFS = \"\\t\" }} NR > 1 && $3 <= fdr {{ n++ }} END {{ print db, ds, n + 0 }}' {input.psms} > {output.summary}",
        )
        .with_input("psms", "score/{db}/{dataset}.psms.tsv")
        .with_output("summary", "results/{db}/{dataset}.summary.tsv")
        .with_log("logs/aggregate/{db}/{dataset}.log")
        .with_param("fdr", DEFAULT_FDR),
        Rule::new("combine", "cat {input.summaries} > {output.table}")
            .with_expanded_input("summaries", "results/{db}/{dataset}.summary.tsv")
            .with_output("table", "results/{db}/combined.tsv"),
    ]
}

/// Builds a registry holding every pipeline rule.
pub fn registry(config: Arc<PipelineConfig>) -> Result<RuleRegistry> {
    let rules = rules(&config);
    let mut registry = RuleRegistry::new(config);
    registry.register_all(rules)?;
    Ok(registry)
}

/// Concrete targets built by default.
pub fn default_targets(registry: &RuleRegistry) -> Result<Vec<String>> {
    registry.expand(DEFAULT_TARGET)
}
