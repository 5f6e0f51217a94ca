//! Hardware-backed sample source that shells out to the vendor query tool.
use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::warn;

use super::{SampleSource, SourceError};
use crate::sample::{GpuProcess, Sample};

/// Ordered query fields. The parser below indexes into rows positionally, so
/// this list and [`parse_row`] must stay in sync.
const QUERY_FIELDS: &str = "index,name,utilization.gpu,utilization.memory,memory.total,\
memory.used,memory.free,temperature.gpu,power.draw,power.limit,fan.speed,clocks.gr,\
clocks.mem,encoder.stats.sessionCount,decoder.stats.sessionCount";
const QUERY_COLUMN_COUNT: usize = 15;

const PROCESS_FIELDS: &str = "pid,process_name,used_memory";
const PROCESS_COLUMN_COUNT: usize = 3;

/// The query tool emits this for fields the device or driver cannot report.
/// Such fields are coerced to zero rather than failing the record.
const NOT_SUPPORTED: &str = "[Not Supported]";
const NOT_AVAILABLE: &str = "[N/A]";

/// Telemetry source backed by the `nvidia-smi` query interface.
///
/// Each call spawns the binary with a sanitized environment (minimal `PATH`,
/// `LC_ALL=C` so numbers parse predictably) and CSV no-header output.
pub struct SmiSource {
    binary: PathBuf,
}

impl SmiSource {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        SmiSource {
            binary: binary.into(),
        }
    }

    /// Uses `nvidia-smi` from the sanitized `PATH`.
    pub fn default_binary() -> Self {
        SmiSource::new("nvidia-smi")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.env_clear()
            .env("PATH", "/usr/sbin:/usr/bin:/sbin:/bin")
            .env("LC_ALL", "C");
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<String, SourceError> {
        let output: Output = cmd.output().await.map_err(|e| SourceError::Command {
            reason: format!("failed to spawn {}: {}", self.binary.display(), e),
        })?;
        if !output.status.success() {
            return Err(SourceError::Command {
                reason: format!(
                    "{} exited with {}: {}",
                    self.binary.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        String::from_utf8(output.stdout).map_err(|e| SourceError::Command {
            reason: format!("non-utf8 output: {}", e),
        })
    }

    /// Query every device. Malformed rows are skipped with a warning so one
    /// bad record cannot take down the whole tick.
    async fn query_all(&self) -> Result<Vec<Sample>, SourceError> {
        let mut cmd = self.command();
        cmd.arg(format!("--query-gpu={}", QUERY_FIELDS))
            .arg("--format=csv,noheader,nounits");
        let stdout = self.run(cmd).await?;

        let mut samples = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match parse_row(line) {
                Ok(sample) => samples.push(sample),
                Err(e) => warn!(error = %e, "skipping malformed telemetry record"),
            }
        }
        Ok(samples)
    }
}

#[async_trait]
impl SampleSource for SmiSource {
    async fn device_ids(&self) -> Result<Vec<String>, SourceError> {
        Ok(self
            .query_all()
            .await?
            .into_iter()
            .map(|s| s.device_id)
            .collect())
    }

    async fn sample(&self, device_id: &str) -> Result<Sample, SourceError> {
        let mut sample = self
            .query_all()
            .await?
            .into_iter()
            .find(|s| s.device_id == device_id)
            .ok_or_else(|| SourceError::UnknownDevice {
                id: device_id.to_string(),
            })?;

        // Process count comes from a separate invocation. Losing it does not
        // lose the sample.
        match self.running_processes(device_id).await {
            Ok(processes) => sample.process_count = processes.len() as u32,
            Err(e) => warn!(device_id = %device_id, error = %e, "process query failed"),
        }
        Ok(sample)
    }

    async fn running_processes(&self, device_id: &str) -> Result<Vec<GpuProcess>, SourceError> {
        let mut cmd = self.command();
        cmd.arg(format!("--query-compute-apps={}", PROCESS_FIELDS))
            .arg("--format=csv,noheader,nounits")
            .arg("-i")
            .arg(device_id);
        let stdout = self.run(cmd).await?;

        let mut processes = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match parse_process_row(line) {
                Ok(p) => processes.push(p),
                Err(e) => warn!(error = %e, "skipping malformed process record"),
            }
        }
        Ok(processes)
    }
}

fn split_row(line: &str, expected: usize) -> Result<Vec<&str>, SourceError> {
    let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
    if fields.len() != expected {
        return Err(SourceError::Parse {
            line: line.to_string(),
            reason: format!("expected {} columns, got {}", expected, fields.len()),
        });
    }
    Ok(fields)
}

fn parse_f64(line: &str, field: &str) -> Result<f64, SourceError> {
    if field == NOT_SUPPORTED || field == NOT_AVAILABLE {
        return Ok(0.0);
    }
    field.parse().map_err(|_| SourceError::Parse {
        line: line.to_string(),
        reason: format!("not a number: {:?}", field),
    })
}

fn parse_u64(line: &str, field: &str) -> Result<u64, SourceError> {
    // Values like "1024.00" show up depending on driver version; go through
    // f64 and truncate.
    Ok(parse_f64(line, field)? as u64)
}

/// Parse one CSV row in [`QUERY_FIELDS`] order into a [`Sample`].
fn parse_row(line: &str) -> Result<Sample, SourceError> {
    let fields = split_row(line, QUERY_COLUMN_COUNT)?;

    let mut sample = Sample::empty(fields[0]);
    sample.device_name = fields[1].to_string();
    sample.utilization_pct = parse_f64(line, fields[2])?;
    sample.memory_utilization_pct = parse_f64(line, fields[3])?;
    sample.memory_total_mb = parse_u64(line, fields[4])?;
    sample.memory_used_mb = parse_u64(line, fields[5])?;
    sample.memory_free_mb = parse_u64(line, fields[6])?;
    sample.temperature_c = parse_f64(line, fields[7])?;
    sample.power_draw_w = parse_f64(line, fields[8])?;
    sample.power_limit_w = parse_f64(line, fields[9])?;
    sample.fan_speed_pct = parse_f64(line, fields[10])?;
    sample.clock_graphics_mhz = parse_u64(line, fields[11])? as u32;
    sample.clock_memory_mhz = parse_u64(line, fields[12])? as u32;
    sample.encoder_util_pct = parse_f64(line, fields[13])?;
    sample.decoder_util_pct = parse_f64(line, fields[14])?;
    sample.timestamp = Utc::now();
    Ok(sample)
}

fn parse_process_row(line: &str) -> Result<GpuProcess, SourceError> {
    let fields = split_row(line, PROCESS_COLUMN_COUNT)?;
    Ok(GpuProcess {
        pid: parse_u64(line, fields[0])? as u32,
        name: fields[1].to_string(),
        used_memory_mb: parse_u64(line, fields[2])?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const ROW: &str =
        "0, NVIDIA A100-SXM4-40GB, 87, 54, 40960, 30720, 10240, 64, 312.45, 400.00, 65, 1410, 1215, 1, 0";

    #[test]
    fn test_parse_row() {
        let sample = parse_row(ROW).unwrap();
        assert_eq!(sample.device_id, "0");
        assert_eq!(sample.device_name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(sample.utilization_pct, 87.0);
        assert_eq!(sample.memory_utilization_pct, 54.0);
        assert_eq!(sample.memory_total_mb, 40960);
        assert_eq!(sample.memory_used_mb, 30720);
        assert_eq!(sample.memory_free_mb, 10240);
        assert_eq!(sample.temperature_c, 64.0);
        assert!((sample.power_draw_w - 312.45).abs() < 1e-9);
        assert_eq!(sample.clock_graphics_mhz, 1410);
        assert_eq!(sample.encoder_util_pct, 1.0);
        assert_eq!(sample.memory_used_mb + sample.memory_free_mb, sample.memory_total_mb);
    }

    #[test]
    fn test_not_supported_parses_as_zero() {
        let row = "1, Tesla K80, 12, 3, 12206, 100, 12106, 45, [Not Supported], [Not Supported], [N/A], 875, 2505, 0, 0";
        let sample = parse_row(row).unwrap();
        assert_eq!(sample.power_draw_w, 0.0);
        assert_eq!(sample.power_limit_w, 0.0);
        assert_eq!(sample.fan_speed_pct, 0.0);
        assert_eq!(sample.utilization_pct, 12.0);
    }

    #[test]
    fn test_wrong_column_count_is_parse_error() {
        assert!(matches!(
            parse_row("0, A100, 87"),
            Err(SourceError::Parse { .. })
        ));
    }

    #[test]
    fn test_garbage_field_is_parse_error() {
        let row = ROW.replace("87,", "eighty-seven,");
        assert!(matches!(parse_row(&row), Err(SourceError::Parse { .. })));
    }

    #[test]
    fn test_parse_process_row() {
        let p = parse_process_row("41237, python3, 16384").unwrap();
        assert_eq!(p.pid, 41237);
        assert_eq!(p.name, "python3");
        assert_eq!(p.used_memory_mb, 16384);
    }
}
