use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chartviz_core::{EngineConfig, PatientHistory, PatientId, TaxonomyCatalog};
use chartviz_engine::{
    Dashboard, EmbeddingIndex, MemoryStore, NeighborTable, TabRequest, VectorIndex,
};
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TabKind {
    Overview,
    Systems,
    Labs,
    Meds,
    Cpts,
    Vitals,
    Notes,
    Condition,
}

#[derive(Parser, Debug)]
#[command(
    name = "chartviz-cli",
    about = "Render một tab dashboard lâm sàng từ dữ liệu JSON."
)]
struct Args {
    /// File JSON danh mục mã (chương, phecode, ICD, xét nghiệm, CPT).
    #[arg(long)]
    taxonomy: PathBuf,
    /// File JSON mảng hồ sơ bệnh nhân.
    #[arg(long)]
    histories: PathBuf,
    /// Bảng láng giềng tính sẵn: `{ token: [[token, score], ...] }`.
    #[arg(long, conflicts_with = "vectors")]
    neighbors: Option<PathBuf>,
    /// Vector embedding: `{ "vectors": { token: [f32, ...] } }`.
    #[arg(long)]
    vectors: Option<PathBuf>,
    /// File JSON cấu hình engine (có thể chỉ chứa một phần).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "overview")]
    tab: TabKind,
    #[arg(long)]
    patient: u64,
    /// Ngày "hiện tại" của lưới thời gian, mặc định là hôm nay.
    #[arg(long)]
    today: Option<NaiveDate>,
    /// Phecode cho tab bệnh lý.
    #[arg(long)]
    phecode: Option<String>,
    /// Ngưỡng liên quan cho tab bệnh lý.
    #[arg(long)]
    relevance: Option<f64>,
    /// Ngày cần tìm ghi chú.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Dời ngày hồ sơ cũ để hoạt động gần nhất rơi vào `today`.
    #[arg(long)]
    dateshift: bool,
}

fn read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Không đọc được file {path:?}"))
}

fn load_index(args: &Args) -> anyhow::Result<Arc<dyn EmbeddingIndex>> {
    if let Some(path) = &args.neighbors {
        let table = NeighborTable::from_json(&read(path)?)
            .with_context(|| format!("Bảng láng giềng không hợp lệ: {path:?}"))?;
        return Ok(Arc::new(table));
    }
    if let Some(path) = &args.vectors {
        let index = VectorIndex::from_json(&read(path)?)
            .with_context(|| format!("File vector không hợp lệ: {path:?}"))?;
        return Ok(Arc::new(index));
    }
    tracing::warn!("Không có chỉ mục embedding, tab bệnh lý sẽ không có mã liên quan");
    Ok(Arc::new(NeighborTable::default()))
}

fn build_request(args: &Args, today: NaiveDate) -> anyhow::Result<TabRequest> {
    let patient_id = PatientId(args.patient);
    let request = match args.tab {
        TabKind::Overview => TabRequest::Overview { patient_id, today },
        TabKind::Systems => TabRequest::Systems { patient_id, today },
        TabKind::Labs => TabRequest::Labs { patient_id, today },
        TabKind::Meds => TabRequest::Meds { patient_id, today },
        TabKind::Cpts => TabRequest::Cpts { patient_id, today },
        TabKind::Vitals => TabRequest::Vitals { patient_id, today },
        TabKind::Notes => {
            let Some(date) = args.date else {
                bail!("Tab notes cần --date");
            };
            TabRequest::Notes {
                patient_id,
                today,
                date,
            }
        }
        TabKind::Condition => {
            let Some(phecode) = args.phecode.clone() else {
                bail!("Tab condition cần --phecode");
            };
            TabRequest::Condition {
                patient_id,
                today,
                phecode,
                relevance: args.relevance,
            }
        }
    };
    Ok(request)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let today = args
        .today
        .unwrap_or_else(|| chrono::Local::now().date_naive());

    let config: EngineConfig = match &args.config {
        Some(path) => serde_json::from_str(&read(path)?)
            .with_context(|| format!("Cấu hình không hợp lệ: {path:?}"))?,
        None => EngineConfig::default(),
    };

    let taxonomy: TaxonomyCatalog = serde_json::from_str(&read(&args.taxonomy)?)
        .with_context(|| format!("Danh mục mã không hợp lệ: {:?}", args.taxonomy))?;
    let mut histories: Vec<PatientHistory> = serde_json::from_str(&read(&args.histories)?)
        .with_context(|| format!("Hồ sơ bệnh nhân không hợp lệ: {:?}", args.histories))?;
    if args.dateshift {
        for history in &mut histories {
            history.dateshift(today, config.dateshift_min_offset_days);
        }
    }

    let store = Arc::new(MemoryStore::new(taxonomy, histories)?);
    let index = load_index(&args)?;
    let request = build_request(&args, today)?;
    let dashboard = Dashboard::new(store.clone(), store, index, config);

    let value = dashboard
        .render(&request)
        .with_context(|| format!("Không render được tab {:?}", args.tab))?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    Ok(())
}
