use anyhow::Result;
use clap::Parser;

// ==================================================================================
// Main entry point and CLI command definitions
// ==================================================================================

#[derive(Parser, Debug)]
#[command(
    name = "clb_screen",
    version = "v0.3.0",
    about = "A toolkit for colibactin (clb) gene-cluster screening in metagenomic reads: BLAST hit tallying, paired-end FASTA combining, and FASTQ to FASTA conversion."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Tally unique read hits per clb gene from BLAST tabular results and write a report
    Tally(tally::Args),

    /// Combine paired-end FASTA files of one sample with :1/:2 read-direction tags
    Combine(combine::Args),

    /// Convert FASTQ files (plain, .gz or .bz2) to FASTA, grouped by sample accession
    #[command(name = "fastq2fasta")]
    Fastq2Fasta(fastq2fasta::Args),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Tally(args) => tally::run(args),
        Commands::Combine(args) => combine::run(args),
        Commands::Fastq2Fasta(args) => fastq2fasta::run(args),
    }
}

// ==================================================================================
// `common` module: Shared utility functions
// ==================================================================================
mod common {
    use anyhow::{Context, Result};
    use bzip2::bufread::MultiBzDecoder;
    use flate2::bufread::MultiGzDecoder;
    use std::fs::File;
    use std::io::{BufRead, BufReader};
    use std::path::Path;

    /// Opens a text file for line-based reading, transparently decompressing
    /// `.gz` and `.bz2` inputs based on the file name.
    pub fn open_text_reader(path: &Path) -> Result<Box<dyn BufRead>> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open input file: {}", path.display()))?;
        let buf_reader = BufReader::new(file);
        let name = path.to_string_lossy();
        let reader: Box<dyn BufRead> = if name.ends_with(".gz") {
            Box::new(BufReader::new(MultiGzDecoder::new(buf_reader)))
        } else if name.ends_with(".bz2") {
            Box::new(BufReader::new(MultiBzDecoder::new(buf_reader)))
        } else {
            Box::new(buf_reader)
        };
        Ok(reader)
    }

}

// ==================================================================================
// `patterns` module: Ordered-rule extraction of sample IDs, read numbers and
// BLAST parameters from loosely structured subject strings and file names
// ==================================================================================
mod patterns {
    use lazy_static::lazy_static;
    use regex::Regex;

    lazy_static! {
        /// Sample-identifier rules, tried in order with first-match-wins
        /// semantics. Platform accessions (DRR/SRR/ERR) win over generic
        /// uppercase prefixes, which win over separator-based splits.
        static ref SAMPLE_ID_RULES: Vec<Regex> = vec![
            Regex::new(r"(DRR\d+)").unwrap(),
            Regex::new(r"(SRR\d+)").unwrap(),
            Regex::new(r"(ERR\d+)").unwrap(),
            Regex::new(r"([A-Z]{2,4}\d{4,})").unwrap(),
            Regex::new(r"^(\w+?)[._:-]").unwrap(),
            Regex::new(r"^([^._:-]+)").unwrap(),
        ];

        /// Numeric read-suffix rules tried after the identifier-prefixed rule.
        static ref NUMBER_RULES: Vec<Regex> = vec![
            Regex::new(r"[._:-](\d+)[._:-]").unwrap(),
            Regex::new(r"[._:-](\d+)$").unwrap(),
            Regex::new(r"^[^._:-]*[._:-](\d+)").unwrap(),
        ];

        static ref DIGIT_RUNS: Regex = Regex::new(r"\d+").unwrap();

        /// Fallback rules recovering a sample ID from the alignment file name
        /// when no subject string yielded one.
        static ref FILENAME_SAMPLE_RULES: Vec<Regex> = vec![
            Regex::new(r"([A-Z]{2,4}\d{4,}).*_alignment\.txt").unwrap(),
            Regex::new(r"(.+?)_identity\d+.*_alignment\.txt").unwrap(),
            Regex::new(r"(.+?)_alignment\.txt").unwrap(),
            Regex::new(r"^([^_]+)").unwrap(),
        ];

        static ref PARAM_RULES: Vec<ParamRule> = vec![
            ParamRule { re: Regex::new(r"(?i)identity(\d+).*evalue([\de.+-]+)").unwrap(), capture: ParamCapture::Both },
            ParamRule { re: Regex::new(r"(?i)id(\d+).*e([\de.+-]+)").unwrap(), capture: ParamCapture::Both },
            ParamRule { re: Regex::new(r"(?i)(\d+).*evalue([\de.+-]+)").unwrap(), capture: ParamCapture::Both },
            ParamRule { re: Regex::new(r"(?i)identity(\d+)").unwrap(), capture: ParamCapture::Identity },
            ParamRule { re: Regex::new(r"(?i)evalue([\de.+-]+)").unwrap(), capture: ParamCapture::Evalue },
        ];

        static ref ACCESSION: Regex = Regex::new(r"((?:DRR|SRR|ERR)\d+)").unwrap();
    }

    enum ParamCapture {
        Both,
        Identity,
        Evalue,
    }

    struct ParamRule {
        re: Regex,
        capture: ParamCapture,
    }

    /// Identity threshold and e-value recovered from an alignment file name.
    /// Absent values are rendered as "unknown" only at the report boundary.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct BlastParams {
        pub identity: Option<String>,
        pub evalue: Option<String>,
    }

    impl BlastParams {
        pub fn key(&self) -> String {
            match (&self.identity, &self.evalue) {
                (Some(identity), Some(evalue)) => format!("identity{identity}_evalue{evalue}"),
                _ => "default".to_string(),
            }
        }
    }

    /// Caches the sample identifier inferred from the first subject string of
    /// a file scan, together with the identifier-prefixed numeric rule.
    pub struct SubjectParser {
        sample_id: Option<String>,
        id_rule: Option<Regex>,
        inferred: bool,
    }

    impl SubjectParser {
        pub fn new() -> Self {
            Self { sample_id: None, id_rule: None, inferred: false }
        }

        /// Infers the sample identifier from the first subject seen; later
        /// calls are no-ops even when the first subject yielded nothing.
        pub fn observe(&mut self, subject: &str) {
            if self.inferred {
                return;
            }
            self.inferred = true;
            self.sample_id = sample_id(subject);
            self.id_rule = self.sample_id.as_deref().map(id_number_rule);
        }

        pub fn sample_id(&self) -> Option<&str> {
            self.sample_id.as_deref()
        }

        pub fn read_number(&self, subject: &str) -> Option<String> {
            extract_number(subject, self.sample_id.as_deref(), self.id_rule.as_ref())
        }
    }

    pub fn sample_id(subject: &str) -> Option<String> {
        SAMPLE_ID_RULES
            .iter()
            .find_map(|rule| rule.captures(subject).map(|c| c[1].to_string()))
    }

    pub fn read_number(subject: &str, sample_id: Option<&str>) -> Option<String> {
        let id_rule = sample_id.map(id_number_rule);
        extract_number(subject, sample_id, id_rule.as_ref())
    }

    fn id_number_rule(id: &str) -> Regex {
        Regex::new(&format!(r"{}[._:-](\d+)", regex::escape(id)))
            .expect("escaped identifier pattern is a valid regex")
    }

    fn extract_number(
        subject: &str,
        sample_id: Option<&str>,
        id_rule: Option<&Regex>,
    ) -> Option<String> {
        if let Some(rule) = id_rule {
            if let Some(c) = rule.captures(subject) {
                return Some(c[1].to_string());
            }
        }
        for rule in NUMBER_RULES.iter() {
            if let Some(c) = rule.captures(subject) {
                return Some(c[1].to_string());
            }
        }
        // Last resort: take the first digit run longer than 3 that does not
        // re-match the tail of the identifier itself.
        let tail = sample_id.map(|id| {
            if id.len() > 3 {
                id.get(id.len() - 3..).unwrap_or(id)
            } else {
                id
            }
        });
        DIGIT_RUNS
            .find_iter(subject)
            .map(|m| m.as_str())
            .find(|num| num.len() > 3 && tail.map_or(true, |t| !num.starts_with(t)))
            .map(|num| num.to_string())
    }

    pub fn filename_sample_id(file_name: &str) -> Option<String> {
        FILENAME_SAMPLE_RULES.iter().find_map(|rule| {
            rule.captures(file_name).and_then(|c| {
                let id = &c[1];
                if id.is_empty() || id == "Unknown" {
                    None
                } else {
                    Some(id.to_string())
                }
            })
        })
    }

    pub fn blast_params(file_name: &str) -> BlastParams {
        let mut params = BlastParams::default();
        for rule in PARAM_RULES.iter() {
            if let Some(c) = rule.re.captures(file_name) {
                match rule.capture {
                    ParamCapture::Both => {
                        params.identity = Some(c[1].to_string());
                        params.evalue = Some(c[2].to_string());
                    }
                    ParamCapture::Identity => params.identity = Some(c[1].to_string()),
                    ParamCapture::Evalue => params.evalue = Some(c[1].to_string()),
                }
                if params.identity.is_some() && params.evalue.is_some() {
                    break;
                }
            }
        }
        params
    }

    /// Platform accession (DRR/SRR/ERR plus digits) embedded in a file name.
    pub fn accession(file_name: &str) -> Option<String> {
        ACCESSION.captures(file_name).map(|c| c[1].to_string())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn platform_prefix_wins_over_generic_prefix() {
            assert_eq!(sample_id("DRR171459.16276716:2"), Some("DRR171459".to_string()));
            assert_eq!(sample_id("SRR123456_789012-3"), Some("SRR123456".to_string()));
            assert_eq!(sample_id("ERR000001.1"), Some("ERR000001".to_string()));
        }

        #[test]
        fn generic_uppercase_prefix_matches_custom_ids() {
            assert_eq!(sample_id("ABCD12345.678"), Some("ABCD12345".to_string()));
        }

        #[test]
        fn separator_rules_cover_loose_formats() {
            assert_eq!(sample_id("sample_01:99999"), Some("sample".to_string()));
            assert_eq!(sample_id("plainname"), Some("plainname".to_string()));
        }

        #[test]
        fn sample_id_is_absent_when_nothing_matches() {
            assert_eq!(sample_id(".:-_"), None);
            assert_eq!(sample_id(""), None);
        }

        #[test]
        fn read_number_prefers_identifier_prefixed_digits() {
            assert_eq!(
                read_number("DRR171459.16276716:2", Some("DRR171459")),
                Some("16276716".to_string())
            );
        }

        #[test]
        fn read_number_falls_back_through_separator_rules() {
            // Digits bounded by separators on both sides.
            assert_eq!(read_number("x.12345:9", None), Some("12345".to_string()));
            // Digits after a separator at the end of the string.
            assert_eq!(read_number("sample_777", None), Some("777".to_string()));
        }

        #[test]
        fn read_number_digit_run_fallback_skips_short_runs() {
            // No separators at all, so only the digit-run scan can apply.
            assert_eq!(
                read_number("read12345six", Some("read12345six")),
                Some("12345".to_string())
            );
            assert_eq!(read_number("ab123cd", None), None);
        }

        #[test]
        fn digit_run_fallback_rejects_identifier_tail() {
            // "67890" starts with the identifier tail "678" and is rejected;
            // no other run is long enough, so extraction fails.
            assert_eq!(read_number("S678x67890", Some("S678")), None);
        }

        #[test]
        fn subject_parser_caches_first_inference() {
            let mut parser = SubjectParser::new();
            parser.observe("DRR171459.111:1");
            parser.observe("SRR999999.222:1");
            assert_eq!(parser.sample_id(), Some("DRR171459"));
            assert_eq!(parser.read_number("DRR171459.333:1"), Some("333".to_string()));
        }

        #[test]
        fn subject_parser_stays_unknown_after_first_failure() {
            let mut parser = SubjectParser::new();
            parser.observe(".:-");
            parser.observe("DRR171459.111:1");
            assert_eq!(parser.sample_id(), None);
        }

        #[test]
        fn blast_params_standard_pattern() {
            let params = blast_params("DRR171459_identity90_evalue1e-5_alignment.txt");
            assert_eq!(params.identity.as_deref(), Some("90"));
            assert_eq!(params.evalue.as_deref(), Some("1e-5"));
            assert_eq!(params.key(), "identity90_evalue1e-5");
        }

        #[test]
        fn blast_params_identity_only_defaults_key() {
            let params = blast_params("sample_identity85_alignment.txt");
            assert_eq!(params.identity.as_deref(), Some("85"));
            assert_eq!(params.evalue, None);
            assert_eq!(params.key(), "default");
        }

        #[test]
        fn blast_params_nothing_recovered() {
            let params = blast_params("results.tsv");
            assert_eq!(params, BlastParams::default());
            assert_eq!(params.key(), "default");
        }

        #[test]
        fn filename_fallback_recovers_accession_like_ids() {
            assert_eq!(
                filename_sample_id("TEST1234_identity90_alignment.txt"),
                Some("TEST1234".to_string())
            );
            assert_eq!(
                filename_sample_id("gut_meta_identity90_evalue1e-5_alignment.txt"),
                Some("gut_meta".to_string())
            );
            assert_eq!(filename_sample_id("sample7_alignment.txt"), Some("sample7".to_string()));
            assert_eq!(filename_sample_id("loosefile.tsv"), Some("loosefile.tsv".to_string()));
        }

        #[test]
        fn accession_recognizes_all_platform_prefixes() {
            assert_eq!(accession("DRR171459_1.fastq.gz"), Some("DRR171459".to_string()));
            assert_eq!(accession("x_ERR000001.fq.bz2"), Some("ERR000001".to_string()));
            assert_eq!(accession("reads.fastq"), None);
        }
    }
}

// ==================================================================================
// `tally` subcommand module: BLAST alignment tallying and report generation
// ==================================================================================
mod tally {
    use super::{common, patterns};
    use anyhow::{bail, Context, Result};
    use bio::io::fasta;
    use clap::Parser;
    use glob::glob;
    use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
    use std::fs;
    use std::fs::File;
    use std::io::{BufRead, BufReader};
    use std::path::{Path, PathBuf};

    /// The 19 clb-cluster gene tags every report row carries a column for.
    pub const GENE_GROUPS: [&str; 19] = [
        "clbA", "clbB", "clbC", "clbD", "clbE", "clbF", "clbG", "clbH", "clbI", "clbJ",
        "clbK", "clbL", "clbM", "clbN", "clbO", "clbP", "clbQ", "clbR", "clbS",
    ];

    const FASTA_EXTS: [&str; 5] = [".fa", ".fasta", ".fna", ".fa.gz", ".fasta.gz"];
    const ALTERNATIVE_PATTERNS: [&str; 4] = ["*.txt", "*alignment*", "*blast*", "*result*"];

    /// Excel limits sheet names to 31 characters; the per-parameter report
    /// files keep the same truncation for their key component.
    const SHEET_KEY_LIMIT: usize = 31;

    #[derive(Parser, Debug)]
    pub struct Args {
        #[arg(short = 'i', long, help = "Directory containing BLAST tabular result files (*_alignment.txt)")]
        pub input_dir: PathBuf,

        #[arg(long, help = "Directory of combined FASTA files, used to look up total read counts")]
        pub fasta_dir: Option<PathBuf>,

        #[arg(short = 'o', long, help = "Output CSV path for the report", default_value = "clb_counts.csv")]
        pub output: PathBuf,

        #[arg(long, help = "Also write one CSV per identity/e-value combination")]
        pub split_by_parameters: bool,
    }

    /// Aggregation result of one alignment file: per-group sets of distinct
    /// read numbers plus the raw hit count.
    #[derive(Debug, Default, PartialEq)]
    pub struct FileTally {
        pub sample_id: Option<String>,
        pub groups: HashMap<String, HashSet<String>>,
        pub hits: u64,
    }

    pub fn aggregate_file(path: &Path) -> Result<FileTally> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open alignment file: {}", path.display()))?;
        let mut parser = patterns::SubjectParser::new();
        let mut groups: HashMap<String, HashSet<String>> = HashMap::new();
        let mut hits = 0u64;

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.starts_with('#') {
                continue;
            }
            let line = line.trim();
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 2 {
                continue;
            }
            let query = parts[0];
            let group = query.split('.').next().unwrap_or(query);
            let subject = parts[1];

            hits += 1;
            parser.observe(subject);
            // A line without an extractable number still counts as a raw hit.
            if let Some(num) = parser.read_number(subject) {
                groups.entry(group.to_string()).or_default().insert(num);
            }
        }

        Ok(FileTally { sample_id: parser.sample_id().map(str::to_string), groups, hits })
    }

    /// One report row per alignment file. Optional fields are rendered as
    /// display sentinels ("unknown", "N/A") only when a sheet is written.
    #[derive(Debug, Clone)]
    pub struct ReportRow {
        pub sample: String,
        pub identity: Option<String>,
        pub evalue: Option<String>,
        pub total_reads: Option<u64>,
        pub group_counts: Vec<u64>,
        pub total_clb: u64,
        pub detected_genes: u64,
        pub pks_positive_clbb: u8,
        pub pks_positive_cluster: u8,
        pub param_key: String,
    }

    impl ReportRow {
        fn header() -> Vec<String> {
            let mut header = vec![
                "Sample".to_string(),
                "Identity_Threshold".to_string(),
                "E_value".to_string(),
                "Total_reads".to_string(),
            ];
            header.extend(GENE_GROUPS.iter().map(|g| g.to_string()));
            header.push("Total_clb_reads".to_string());
            header.push("Detected_genes_count".to_string());
            header.push("pks_positive_clbB".to_string());
            header.push("pks_positive_cluster".to_string());
            header
        }

        fn identity_display(&self) -> String {
            match &self.identity {
                Some(identity) => format!("{identity}%"),
                None => "unknown".to_string(),
            }
        }

        /// Console narration carries the percent sign even when the
        /// threshold is unknown; the written sheets do not.
        fn identity_percent(&self) -> String {
            format!("{}%", self.identity.as_deref().unwrap_or("unknown"))
        }

        fn evalue_display(&self) -> String {
            self.evalue.clone().unwrap_or_else(|| "unknown".to_string())
        }

        fn total_reads_display(&self) -> String {
            match self.total_reads {
                Some(n) if n > 0 => n.to_string(),
                _ => "N/A".to_string(),
            }
        }

        fn to_record(&self) -> Vec<String> {
            let mut record = vec![
                self.sample.clone(),
                self.identity_display(),
                self.evalue_display(),
                self.total_reads_display(),
            ];
            record.extend(self.group_counts.iter().map(|c| c.to_string()));
            record.push(self.total_clb.to_string());
            record.push(self.detected_genes.to_string());
            record.push(self.pks_positive_clbb.to_string());
            record.push(self.pks_positive_cluster.to_string());
            record
        }
    }

    pub fn build_row(
        tally: &FileTally,
        sample: Option<&str>,
        params: &patterns::BlastParams,
        total_reads: Option<u64>,
    ) -> ReportRow {
        let counts: HashMap<&str, u64> =
            tally.groups.iter().map(|(g, nums)| (g.as_str(), nums.len() as u64)).collect();

        let group_counts: Vec<u64> =
            GENE_GROUPS.iter().map(|g| counts.get(g).copied().unwrap_or(0)).collect();
        // Totals run over every group seen in the file, not only the fixed 19.
        let total_clb: u64 = counts.values().sum();
        let detected_genes = counts.values().filter(|&&c| c > 0).count() as u64;

        ReportRow {
            sample: sample.unwrap_or("Unknown").to_string(),
            identity: params.identity.clone(),
            evalue: params.evalue.clone(),
            total_reads,
            group_counts,
            total_clb,
            detected_genes,
            pks_positive_clbb: u8::from(counts.get("clbB").copied().unwrap_or(0) > 0),
            pks_positive_cluster: u8::from(total_clb > 0),
            param_key: params.key(),
        }
    }

    fn glob_files(pattern: &str) -> Result<Vec<PathBuf>> {
        let paths = glob(pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))?;
        Ok(paths.filter_map(|p| p.ok()).filter(|p| p.is_file()).collect())
    }

    fn discover_alignment_files(input_dir: &Path) -> Result<Vec<PathBuf>> {
        if !input_dir.is_dir() {
            bail!(
                "Input directory not found: {}. Pass the directory that holds the BLAST result files.",
                input_dir.display()
            );
        }
        let dir = input_dir.display();
        let mut files = glob_files(&format!("{dir}/*_alignment.txt"))?;
        if files.is_empty() {
            files = glob_files(&format!("{dir}/**/*_alignment.txt"))?;
        }
        if files.is_empty() {
            for pattern in ALTERNATIVE_PATTERNS {
                files = glob_files(&format!("{dir}/**/{pattern}"))?;
                if !files.is_empty() {
                    println!("Found files using pattern: {pattern}");
                    break;
                }
            }
        }
        if files.is_empty() {
            bail!(
                "No alignment files found in {} (searched *_alignment.txt, *.txt, *alignment*, *blast*, *result*). Verify that the BLAST search completed.",
                input_dir.display()
            );
        }
        files.sort();
        Ok(files)
    }

    pub fn find_matching_fasta(fasta_dir: &Path, sample_id: &str) -> Option<PathBuf> {
        if !fasta_dir.is_dir() {
            return None;
        }
        let dir = fasta_dir.display();
        for ext in FASTA_EXTS {
            let exact = fasta_dir.join(format!("{sample_id}{ext}"));
            if exact.is_file() {
                return Some(exact);
            }
            if let Ok(paths) = glob(&format!("{dir}/{sample_id}*{ext}")) {
                if let Some(path) = paths.filter_map(|p| p.ok()).next() {
                    return Some(path);
                }
            }
            // Case-insensitive substring match over everything with this extension.
            let needle = sample_id.to_lowercase();
            if let Ok(paths) = glob(&format!("{dir}/*{ext}")) {
                for path in paths.filter_map(|p| p.ok()) {
                    let matches = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map_or(false, |n| n.to_lowercase().contains(&needle));
                    if matches {
                        return Some(path);
                    }
                }
            }
        }
        None
    }

    /// Total read count of a FASTA file, one record per read. An unreadable or
    /// malformed file yields `None` and is reported as "N/A", never fatally.
    pub fn count_fasta_reads(path: &Path) -> Option<u64> {
        let reader = common::open_text_reader(path).ok()?;
        let mut count = 0u64;
        for record in fasta::Reader::new(reader).records() {
            if record.is_err() {
                return None;
            }
            count += 1;
        }
        Some(count)
    }

    fn write_sheet(path: &Path, rows: &[ReportRow]) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        writer.write_record(ReportRow::header())?;
        for row in rows {
            writer.write_record(row.to_record())?;
        }
        writer.flush()?;
        Ok(())
    }

    fn print_group_stats(rows: &[&ReportRow]) {
        let n = rows.len();
        let clbb_positive = rows.iter().filter(|r| r.pks_positive_clbb == 1).count();
        let cluster_positive = rows.iter().filter(|r| r.pks_positive_cluster == 1).count();
        let pct = |count: usize| count as f64 * 100.0 / n as f64;
        println!(
            "    Positive by clbB criterion: {clbb_positive}/{n} samples ({:.1}%)",
            pct(clbb_positive)
        );
        println!(
            "    Positive by cluster criterion: {cluster_positive}/{n} samples ({:.1}%)",
            pct(cluster_positive)
        );

        let reads: Vec<u64> =
            rows.iter().filter_map(|r| r.total_reads.filter(|&t| t > 0)).collect();
        if reads.is_empty() {
            println!("    Total reads: could not retrieve from FASTA files");
        } else {
            let avg = reads.iter().sum::<u64>() as f64 / reads.len() as f64;
            println!(
                "    Average total reads: {avg:.0} reads/sample (retrieved from {}/{n} samples)",
                reads.len()
            );
        }

        let detected: Vec<(usize, usize)> = GENE_GROUPS
            .iter()
            .enumerate()
            .map(|(idx, _)| (idx, rows.iter().filter(|r| r.group_counts[idx] > 0).count()))
            .filter(|&(_, positive)| positive > 0)
            .collect();
        if !detected.is_empty() {
            println!("    Individual gene detection rates:");
            for (idx, positive) in detected {
                println!("      {}: {positive}/{n} ({:.1}%)", GENE_GROUPS[idx], pct(positive));
            }
        }
    }

    fn print_statistics(rows: &[ReportRow]) {
        if rows.is_empty() {
            return;
        }
        println!("\nStatistics:");
        let mut by_params: BTreeMap<(String, String), Vec<&ReportRow>> = BTreeMap::new();
        for row in rows {
            by_params
                .entry((row.identity_display(), row.evalue_display()))
                .or_default()
                .push(row);
        }
        if by_params.len() > 1 {
            for ((identity, evalue), group) in &by_params {
                println!("\n  Parameters: identity={identity}, evalue={evalue}");
                print_group_stats(group);
            }
        } else {
            println!("\n  Overall ({} samples):", rows.len());
            let all: Vec<&ReportRow> = rows.iter().collect();
            print_group_stats(&all);
        }
    }

    pub fn run(args: Args) -> Result<()> {
        println!("clb gene count analysis (colibactin screening)");
        println!("Input directory: {}", args.input_dir.display());
        if let Some(fasta_dir) = &args.fasta_dir {
            println!("FASTA directory: {}", fasta_dir.display());
        }
        println!("Output file: {}", args.output.display());
        println!("Parameter-specific output: {}", args.split_by_parameters);
        println!("{}", "-".repeat(50));

        let alignment_files = discover_alignment_files(&args.input_dir)?;
        println!("Number of files to process: {}", alignment_files.len());

        let mut all_rows: Vec<ReportRow> = Vec::new();
        let mut param_rows: BTreeMap<String, Vec<ReportRow>> = BTreeMap::new();
        let mut found_patterns: BTreeSet<&'static str> = BTreeSet::new();

        for path in &alignment_files {
            let file_name =
                path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            println!("Processing: {file_name}");

            let params = patterns::blast_params(&file_name);
            let tally = aggregate_file(path)?;

            // Subject strings first, then the file name as a fallback.
            let sample =
                tally.sample_id.clone().or_else(|| patterns::filename_sample_id(&file_name));

            if let Some(id) = &sample {
                let kind = if id.starts_with("DRR") {
                    "DRR"
                } else if id.starts_with("SRR") {
                    "SRR"
                } else if id.starts_with("ERR") {
                    "ERR"
                } else {
                    "Custom"
                };
                found_patterns.insert(kind);
            }

            let mut total_reads = None;
            if let (Some(fasta_dir), Some(id)) = (&args.fasta_dir, &sample) {
                match find_matching_fasta(fasta_dir, id) {
                    Some(fasta_path) => {
                        total_reads = count_fasta_reads(&fasta_path);
                        let fasta_name = fasta_path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        println!("  → Found FASTA file: {fasta_name}");
                    }
                    None => println!("  → FASTA file not found for sample: {id}"),
                }
            }

            let row = build_row(&tally, sample.as_deref(), &params, total_reads);
            println!("  → Sample ID: {}", row.sample);
            println!("  → BLAST hits: {}", tally.hits);
            println!("  → Total reads of detected clb genes: {}", row.total_clb);
            println!("  → Number of detected genes: {}/19", row.detected_genes);
            println!(
                "  → Parameters: identity={}, evalue={}",
                row.identity_percent(),
                row.evalue_display()
            );
            println!("  → Total reads: {}", row.total_reads_display());

            if args.split_by_parameters {
                param_rows.entry(row.param_key.clone()).or_default().push(row.clone());
            }
            all_rows.push(row);
        }

        if !found_patterns.is_empty() {
            let kinds: Vec<&str> = found_patterns.iter().copied().collect();
            println!("\nDetected sample ID patterns: {}", kinds.join(", "));
        }

        if let Some(parent) = args.output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create output directory: {}", parent.display())
                })?;
            }
        }

        all_rows.sort_by(|a, b| {
            a.identity_display()
                .cmp(&b.identity_display())
                .then_with(|| a.evalue_display().cmp(&b.evalue_display()))
                .then_with(|| a.sample.cmp(&b.sample))
        });
        write_sheet(&args.output, &all_rows)?;

        if args.split_by_parameters {
            let stem = args.output.file_stem().and_then(|s| s.to_str()).unwrap_or("clb_counts");
            for (key, mut rows) in param_rows {
                rows.sort_by(|a, b| a.sample.cmp(&b.sample));
                let key_part = &key[..key.len().min(SHEET_KEY_LIMIT)];
                let sheet_path = args.output.with_file_name(format!("{stem}_{key_part}.csv"));
                write_sheet(&sheet_path, &rows)?;
            }
        }

        println!("\nProcessing complete:");
        println!("  Number of processed files: {}", alignment_files.len());
        println!("  Results saved to '{}'", args.output.display());
        println!("  Number of output rows: {}", all_rows.len());
        print_statistics(&all_rows);

        Ok(())
    }

}

// ==================================================================================
// `combine` subcommand module: paired-end FASTA concatenation
// ==================================================================================
mod combine {
    use anyhow::{bail, Context, Result};
    use clap::Parser;
    use std::fs;
    use std::fs::File;
    use std::io::{BufRead, BufReader, BufWriter, Write};
    use std::path::{Path, PathBuf};

    #[derive(Parser, Debug)]
    pub struct Args {
        #[arg(short = 'd', long, help = "Folder containing {accession}_1.fa and {accession}_2.fa")]
        pub folder: PathBuf,

        #[arg(short = 'a', long, help = "Sample accession (e.g. DRR171459)")]
        pub accession: String,

        #[arg(short = 'o', long, help = "Output folder for the combined FASTA file")]
        pub output_dir: PathBuf,
    }

    /// Appends ":{direction}" to the first whitespace-delimited token of a
    /// header line, keeping any remaining header text.
    fn tag_header(line: &str, direction: u8) -> String {
        let trimmed = line.trim();
        match trimmed.find(char::is_whitespace) {
            Some(idx) => {
                let (token, rest) = trimmed.split_at(idx);
                let rest = rest.trim_start();
                if rest.is_empty() {
                    format!("{token}:{direction}")
                } else {
                    format!("{token}:{direction} {rest}")
                }
            }
            None => format!("{trimmed}:{direction}"),
        }
    }

    fn copy_tagged(path: &Path, direction: u8, out: &mut impl Write) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open FASTA file: {}", path.display()))?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.starts_with('>') {
                writeln!(out, "{}", tag_header(&line, direction))?;
            } else {
                writeln!(out, "{line}")?;
            }
        }
        Ok(())
    }

    pub fn run(args: Args) -> Result<()> {
        let forward = args.folder.join(format!("{}_1.fa", args.accession));
        let reverse = args.folder.join(format!("{}_2.fa", args.accession));

        println!("FASTA sequence concatenation");
        println!("Target accession: {}", args.accession);
        println!("Input folder: {}", args.folder.display());
        println!("Output folder: {}", args.output_dir.display());
        println!("{}", "-".repeat(50));

        for path in [&forward, &reverse] {
            if !path.is_file() {
                bail!(
                    "Input file not found: {}. Check the folder and accession settings.",
                    path.display()
                );
            }
        }

        fs::create_dir_all(&args.output_dir).with_context(|| {
            format!("Failed to create output folder: {}", args.output_dir.display())
        })?;
        let output_path = args.output_dir.join(format!("{}.fa", args.accession));

        println!("  Input 1: {}", forward.display());
        println!("  Input 2: {}", reverse.display());
        println!("  Output: {}", output_path.display());

        let mut out = BufWriter::new(File::create(&output_path).with_context(|| {
            format!("Failed to create output file: {}", output_path.display())
        })?);
        copy_tagged(&forward, 1, &mut out)?;
        copy_tagged(&reverse, 2, &mut out)?;
        out.flush()?;

        println!("✔ Concatenation completed: {}", output_path.display());
        Ok(())
    }

}

// ==================================================================================
// `fastq2fasta` subcommand module: FASTQ to FASTA conversion
// ==================================================================================
mod fastq2fasta {
    use super::{common, patterns};
    use anyhow::{bail, Context, Result};
    use clap::Parser;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::collections::BTreeMap;
    use std::fs;
    use std::fs::File;
    use std::io::{BufRead, BufWriter, Write};
    use std::path::{Path, PathBuf};

    const FASTQ_EXTS: [&str; 6] =
        [".fastq", ".fq", ".fastq.bz2", ".fq.bz2", ".fastq.gz", ".fq.gz"];

    #[derive(Parser, Debug)]
    pub struct Args {
        #[arg(short = 'i', long, help = "Input FASTQ file or directory of FASTQ files (plain, .gz or .bz2)")]
        pub input: PathBuf,

        #[arg(short = 'o', long, help = "Output FASTA file (file input) or base output directory (directory input)")]
        pub output: PathBuf,
    }

    /// Converts a FASTQ line stream to FASTA. Records whose header does not
    /// start with '@' are dropped; a trailing partial record is discarded.
    /// Returns the number of records written.
    pub fn convert_stream(reader: impl BufRead, writer: &mut impl Write) -> Result<u64> {
        let mut written = 0u64;
        let mut record: Vec<String> = Vec::with_capacity(4);
        for line in reader.lines() {
            let line = line?;
            record.push(line.trim().to_string());
            if record.len() == 4 {
                if let Some(id) = record[0].strip_prefix('@') {
                    writeln!(writer, ">{id}")?;
                    writeln!(writer, "{}", record[1])?;
                    written += 1;
                }
                record.clear();
            }
        }
        Ok(written)
    }

    /// Output name for a converted file: compression suffix stripped, then
    /// the FASTQ extension replaced by ".fa".
    fn fasta_name(file_name: &str) -> String {
        let mut base = file_name;
        for ext in [".bz2", ".gz"] {
            if let Some(stripped) = base.strip_suffix(ext) {
                base = stripped;
            }
        }
        match base.strip_suffix(".fastq").or_else(|| base.strip_suffix(".fq")) {
            Some(stem) => format!("{stem}.fa"),
            None => format!("{base}.fa"),
        }
    }

    fn convert_file(input: &Path, output: &Path) -> Result<u64> {
        let reader = common::open_text_reader(input)?;
        let out_file = File::create(output)
            .with_context(|| format!("Failed to create output file: {}", output.display()))?;
        let mut writer = BufWriter::new(out_file);
        let written = convert_stream(reader, &mut writer)?;
        writer.flush()?;
        Ok(written)
    }

    fn run_directory(input_dir: &Path, output_base: &Path) -> Result<()> {
        let mut by_accession: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let entries = fs::read_dir(input_dir)
            .with_context(|| format!("Failed to read input directory: {}", input_dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !FASTQ_EXTS.iter().any(|ext| name.ends_with(ext)) {
                continue;
            }
            // Files without a recognizable accession are left alone.
            if let Some(acc) = patterns::accession(&name) {
                by_accession.entry(acc).or_default().push(name);
            }
        }

        if by_accession.is_empty() {
            println!(
                "No FASTQ files with a recognizable accession found in {}",
                input_dir.display()
            );
            println!("\nProcessing completed:");
            println!("  Number of accessions: 0");
            println!("  Number of converted files: 0");
            return Ok(());
        }

        fs::create_dir_all(output_base).with_context(|| {
            format!("Failed to create output directory: {}", output_base.display())
        })?;

        let accession_count = by_accession.len();
        let total_files: usize = by_accession.values().map(Vec::len).sum();
        let pb = ProgressBar::new(total_files as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} files {msg}")?,
        );

        let mut converted = 0u64;
        for (accession, mut files) in by_accession {
            files.sort();
            pb.println(format!("Processing accession: {} ({} file(s))", accession, files.len()));
            let accession_dir = output_base.join(&accession);
            fs::create_dir_all(&accession_dir).with_context(|| {
                format!("Failed to create accession directory: {}", accession_dir.display())
            })?;
            for name in files {
                let output_path = accession_dir.join(fasta_name(&name));
                let records = convert_file(&input_dir.join(&name), &output_path)?;
                pb.println(format!(
                    "  → {} ({records} records)",
                    output_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default()
                ));
                converted += 1;
                pb.inc(1);
            }
        }
        pb.finish_with_message("done");

        println!("\nProcessing completed:");
        println!("  Number of accessions: {accession_count}");
        println!("  Number of converted files: {converted}");
        println!("  Output directory: {}", output_base.display());
        Ok(())
    }

    pub fn run(args: Args) -> Result<()> {
        println!("FASTQ to FASTA conversion");
        println!("Input: {}", args.input.display());
        println!("Output: {}", args.output.display());
        println!("{}", "-".repeat(50));

        if args.input.is_dir() {
            run_directory(&args.input, &args.output)
        } else if args.input.is_file() {
            if let Some(parent) = args.output.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create output directory: {}", parent.display())
                    })?;
                }
            }
            let records = convert_file(&args.input, &args.output)?;
            println!("✔ Conversion completed: {} ({records} records)", args.output.display());
            Ok(())
        } else {
            bail!("Input not found: {}", args.input.display());
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Cursor;

        #[test]
        fn four_line_record_converts_to_fasta() -> Result<()> {
            let input = "@id\nSEQ\n+\nQUAL\n";
            let mut out = Vec::new();
            let written = convert_stream(Cursor::new(input), &mut out)?;
            assert_eq!(written, 1);
            assert_eq!(String::from_utf8(out).unwrap(), ">id\nSEQ\n");
            Ok(())
        }

        #[test]
        fn record_without_header_marker_is_dropped() -> Result<()> {
            let input = "@keep\nAAAA\n+\nIIII\nbad\nCCCC\n+\nIIII\n@last\nGGGG\n+\nIIII\n";
            let mut out = Vec::new();
            let written = convert_stream(Cursor::new(input), &mut out)?;
            assert_eq!(written, 2);
            assert_eq!(String::from_utf8(out).unwrap(), ">keep\nAAAA\n>last\nGGGG\n");
            Ok(())
        }

        #[test]
        fn trailing_partial_record_is_discarded() -> Result<()> {
            let input = "@only\nACGT\n+\n";
            let mut out = Vec::new();
            assert_eq!(convert_stream(Cursor::new(input), &mut out)?, 0);
            assert!(out.is_empty());
            Ok(())
        }

        #[test]
        fn fasta_names_strip_compression_and_extension() {
            assert_eq!(fasta_name("DRR171459_1.fastq"), "DRR171459_1.fa");
            assert_eq!(fasta_name("DRR171459_2.fq.gz"), "DRR171459_2.fa");
            assert_eq!(fasta_name("ERR000001.fastq.bz2"), "ERR000001.fa");
        }

        #[test]
        fn gzipped_file_converts_transparently() -> Result<()> {
            let dir = tempfile::tempdir()?;
            let input = dir.path().join("DRR1.fastq.gz");
            let mut encoder = GzEncoder::new(File::create(&input)?, Compression::default());
            encoder.write_all(b"@r1\nACGT\n+\nIIII\n")?;
            encoder.finish()?;
            let output = dir.path().join("DRR1.fa");
            assert_eq!(convert_file(&input, &output)?, 1);
            assert_eq!(fs::read_to_string(&output)?, ">r1\nACGT\n");
            Ok(())
        }

        #[test]
        fn directory_mode_groups_by_accession() -> Result<()> {
            let dir = tempfile::tempdir()?;
            let input = dir.path().join("fastq");
            fs::create_dir(&input)?;
            fs::write(input.join("DRR171459_1.fastq"), "@a\nACGT\n+\nIIII\n")?;
            fs::write(input.join("DRR171459_2.fastq"), "@b\nTTTT\n+\nIIII\n")?;
            fs::write(input.join("SRR000010.fq"), "@c\nGGGG\n+\nIIII\n")?;
            fs::write(input.join("no_accession.fastq"), "@d\nCCCC\n+\nIIII\n")?;
            fs::write(input.join("notes.txt"), "ignored")?;

            let output = dir.path().join("fasta");
            run(Args { input: input.clone(), output: output.clone() })?;

            assert_eq!(
                fs::read_to_string(output.join("DRR171459/DRR171459_1.fa"))?,
                ">a\nACGT\n"
            );
            assert_eq!(
                fs::read_to_string(output.join("DRR171459/DRR171459_2.fa"))?,
                ">b\nTTTT\n"
            );
            assert_eq!(
                fs::read_to_string(output.join("SRR000010/SRR000010.fa"))?,
                ">c\nGGGG\n"
            );
            assert!(!output.join("no_accession").exists());
            Ok(())
        }

        #[test]
        fn directory_without_accessions_completes_with_empty_summary() -> Result<()> {
            let dir = tempfile::tempdir()?;
            let input = dir.path().join("fastq");
            fs::create_dir(&input)?;
            fs::write(input.join("no_accession.fastq"), "@d\nCCCC\n+\nIIII\n")?;
            fs::write(input.join("notes.txt"), "ignored")?;

            let output = dir.path().join("fasta");
            run(Args { input, output: output.clone() })?;
            assert!(!output.exists());
            Ok(())
        }

        #[test]
        fn missing_input_is_fatal() {
            let err = run(Args {
                input: PathBuf::from("/no/such/input"),
                output: PathBuf::from("/tmp/out.fa"),
            })
            .unwrap_err();
            assert!(err.to_string().contains("not found"));
        }
    }
}
