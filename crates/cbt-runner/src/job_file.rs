//! Workload descriptors in the engine's sectioned `key=value` job-file format.

use crate::config::EffectiveConfig;
use crate::fs_util::{atomic_write_bytes, shell_quote};
use crate::provision::VOLUME_PREFIX;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const GLOBAL: &str = "global";
const COUNT_BOUNDED_KEYS: [&str; 2] = ["number_ios", "io_size"];
const RBDNAME_ENV: &str = "CBT_RBDNAME";

/// A `None` value is a bare flag line such as `time_based`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub entries: BTreeMap<String, Option<String>>,
}

impl Section {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_string(), Some(value.into()));
    }

    pub fn flag(&mut self, key: &str) {
        self.entries.insert(key.to_string(), None);
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|v| v.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFile {
    pub sections: Vec<Section>,
}

impl JobFile {
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (idx, section) in self.sections.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", section.name));
            for (k, v) in section.entries.iter() {
                match v {
                    Some(v) => out.push_str(&format!("{}={}\n", k, v)),
                    None => out.push_str(&format!("{}\n", k)),
                }
            }
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut sections: Vec<Section> = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                sections.push(Section::new(name.trim()));
                continue;
            }
            let section = sections.last_mut().ok_or_else(|| {
                anyhow!("line {}: entry outside of any section", lineno + 1)
            })?;
            match line.split_once('=') {
                Some((k, v)) => section.set(k.trim(), v.trim()),
                None => section.flag(line),
            }
        }
        Ok(Self { sections })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub volume: usize,
    pub file: JobFile,
}

impl JobDescriptor {
    pub fn file_name(volume: usize) -> String {
        format!("fio_job_file.{}", volume)
    }

    pub fn remote_path(&self, run_dir: &Path) -> PathBuf {
        run_dir.join(Self::file_name(self.volume))
    }

    /// Writes the descriptor into `staging_dir` and returns the local path.
    pub fn stage(&self, staging_dir: &Path) -> Result<PathBuf> {
        let path = staging_dir.join(Self::file_name(self.volume));
        atomic_write_bytes(&path, self.file.render().as_bytes()).map_err(|e| {
            anyhow!(
                "failed to write job file for volume {} to {}: {}",
                self.volume,
                path.display(),
                e
            )
        })?;
        Ok(path)
    }
}

pub fn output_path(run_dir: &Path, volume: usize) -> PathBuf {
    run_dir.join(format!("output.{}", volume))
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        other => Some(other.to_string()),
    }
}

/// Builds the descriptor for one volume. Every call starts from a fresh
/// global section, so descriptors never share state.
pub fn build_job_descriptor(
    config: &EffectiveConfig,
    volume: usize,
    run_dir: &Path,
    recovery_active: bool,
) -> JobDescriptor {
    let mut global = Section::new(GLOBAL);
    for (k, v) in config.global.iter() {
        match render_value(v) {
            Some(v) => global.set(k, v),
            None => global.flag(k),
        }
    }

    global.set("rw", config.mode.as_str());
    if config.mode.is_mixed() {
        global.set("rwmixread", config.rwmixread.to_string());
        global.set("rwmixwrite", config.rwmixwrite().to_string());
    } else {
        global.remove("rwmixread");
        global.remove("rwmixwrite");
    }
    if let Some(runtime) = config.runtime {
        global.set("runtime", runtime.to_string());
    }
    if let Some(ramp_time) = config.ramp_time {
        global.set("ramp_time", ramp_time.to_string());
    }

    global.set("ioengine", config.ioengine.as_str());
    if config.ioengine == "rbd" {
        global.set("clientname", config.clientname.as_str());
        global.set("pool", config.poolname.as_str());
        global.set("invalidate", "0");
    }
    global.set("numjobs", config.procs_per_volume.to_string());
    global.set("direct", "1");
    global.set("bs", format!("{}B", config.op_size));
    global.set("iodepth", config.iodepth.to_string());
    global.set("end_fsync", config.end_fsync.to_string());

    if recovery_active || config.time_based {
        for key in COUNT_BOUNDED_KEYS {
            global.remove(key);
        }
        global.flag("time_based");
    }
    if let Some(dist) = &config.random_distribution {
        global.set("random_distribution", dist.as_str());
    }
    if let Some(avg) = config.log_avg_msec {
        global.set("log_avg_msec", avg.to_string());
    }
    if let Some(rate) = config.rate_iops {
        global.set("rate_iops", rate.to_string());
    }

    let mut job = Section::new(&format!("librbdfio-{}", volume));
    let out_file = output_path(run_dir, volume).to_string_lossy().to_string();
    job.set("write_iops_log", out_file.as_str());
    job.set("write_bw_log", out_file.as_str());
    job.set("write_lat_log", out_file.as_str());
    if config.ioengine == "rbd" {
        job.set("rbdname", format!("${{{}}}", RBDNAME_ENV));
    }

    JobDescriptor {
        volume,
        file: JobFile {
            sections: vec![global, job],
        },
    }
}

/// Remote command that runs one volume's descriptor on every client. The
/// volume name is resolved on the remote host from its short hostname.
pub fn dispatch_command(config: &EffectiveConfig, volume: usize, run_dir: &Path) -> String {
    let job_file = run_dir.join(JobDescriptor::file_name(volume));
    let output = output_path(run_dir, volume);
    format!(
        "sudo env {}={}-$(hostname -s)-{} {} --output-format=json --output={} {}",
        RBDNAME_ENV,
        VOLUME_PREFIX,
        volume,
        shell_quote(&config.cmd_path),
        shell_quote(&output.to_string_lossy()),
        shell_quote(&job_file.to_string_lossy()),
    )
}
