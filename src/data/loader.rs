use crate::data::{FeatureTable, Ontology, PairSet, TrainingData};
use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, StringRecord};
use flate2::read::GzDecoder;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

/// Edge type marking a term -> term relation in ontology files
pub const TERM_EDGE_TYPE: &str = "default";

/// Field delimiter of the input files
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delimiter {
    Tab,
    Comma,
}

impl Delimiter {
    fn byte(self) -> u8 {
        match self {
            Delimiter::Tab => b'\t',
            Delimiter::Comma => b',',
        }
    }
}

/// Open a file for reading, transparently decompressing `.gz` inputs
fn open<P: AsRef<Path>>(path: P) -> Result<Box<dyn Read>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let gzipped = path.extension().and_then(|e| e.to_str()) == Some("gz");
    debug!("Opening {:?} (gzipped: {})", path, gzipped);

    if gzipped {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Read every non-empty record of a headerless delimited file
fn read_records<R: Read>(reader: R, delimiter: Delimiter, flexible: bool) -> Result<Vec<StringRecord>> {
    let mut csv_reader = ReaderBuilder::new()
        .delimiter(delimiter.byte())
        .has_headers(false)
        .flexible(flexible)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut records = Vec::new();
    for (line, result) in csv_reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to parse line {}", line + 1))?;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        records.push(record);
    }
    Ok(records)
}

fn field<'a>(record: &'a StringRecord, idx: usize, line: usize) -> Result<&'a str> {
    record
        .get(idx)
        .filter(|f| !f.is_empty())
        .with_context(|| format!("Line {} is missing column {}", line + 1, idx + 1))
}

/// Load an `<id>\t<name>` mapping file as `name -> id`
pub fn load_mapping<P: AsRef<Path>>(path: P) -> Result<HashMap<String, usize>> {
    let path = path.as_ref();
    let mapping = parse_mapping(open(path)?)
        .with_context(|| format!("Failed to load mapping from {:?}", path))?;
    info!("Loaded {} entries from {:?}", mapping.len(), path);
    Ok(mapping)
}

fn parse_mapping<R: Read>(reader: R) -> Result<HashMap<String, usize>> {
    let mut mapping = HashMap::new();
    for (line, record) in read_records(reader, Delimiter::Tab, true)?.iter().enumerate() {
        let id = field(record, 0, line)?
            .parse::<usize>()
            .with_context(|| format!("Invalid id on line {}", line + 1))?;
        let name = field(record, 1, line)?;
        mapping.insert(name.to_string(), id);
    }
    Ok(mapping)
}

/// Load `<cell>\t<drug>\t<response>` samples as id pairs
pub fn load_pairs<P: AsRef<Path>>(
    path: P,
    cell2id: &HashMap<String, usize>,
    drug2id: &HashMap<String, usize>,
) -> Result<PairSet> {
    let path = path.as_ref();
    let pairs = parse_pairs(open(path)?, cell2id, drug2id)
        .with_context(|| format!("Failed to load samples from {:?}", path))?;
    info!("Loaded {} samples from {:?}", pairs.len(), path);
    Ok(pairs)
}

fn parse_pairs<R: Read>(
    reader: R,
    cell2id: &HashMap<String, usize>,
    drug2id: &HashMap<String, usize>,
) -> Result<PairSet> {
    let mut pairs = Vec::new();
    let mut labels = Vec::new();

    for (line, record) in read_records(reader, Delimiter::Tab, true)?.iter().enumerate() {
        let cell = field(record, 0, line)?;
        let drug = field(record, 1, line)?;
        let cell_id = *cell2id
            .get(cell)
            .with_context(|| format!("Unknown cell line {} on line {}", cell, line + 1))?;
        let drug_id = *drug2id
            .get(drug)
            .with_context(|| format!("Unknown drug {} on line {}", drug, line + 1))?;
        let label = field(record, 2, line)?
            .parse::<f32>()
            .with_context(|| format!("Invalid response on line {}", line + 1))?;

        pairs.push((cell_id, drug_id));
        labels.push(label);
    }
    PairSet::new(pairs, labels)
}

/// Load train/test samples together with the cell and drug id mappings
pub fn prepare_train_data<P: AsRef<Path>>(
    train_file: P,
    test_file: P,
    cell2id_file: P,
    drug2id_file: P,
) -> Result<(TrainingData, HashMap<String, usize>, HashMap<String, usize>)> {
    let cell2id = load_mapping(cell2id_file)?;
    let drug2id = load_mapping(drug2id_file)?;

    let train = load_pairs(train_file, &cell2id, &drug2id)?;
    let test = load_pairs(test_file, &cell2id, &drug2id)?;

    Ok((TrainingData { train, test }, cell2id, drug2id))
}

/// Load a headerless comma-separated numeric matrix
pub fn load_feature_table<P: AsRef<Path>>(path: P) -> Result<FeatureTable> {
    let path = path.as_ref();
    let table = parse_feature_table(open(path)?)
        .with_context(|| format!("Failed to load features from {:?}", path))?;
    info!("Loaded {}x{} feature table from {:?}", table.rows, table.cols, path);
    Ok(table)
}

fn parse_feature_table<R: Read>(reader: R) -> Result<FeatureTable> {
    let rows = read_records(reader, Delimiter::Comma, false)?
        .iter()
        .enumerate()
        .map(|(line, record)| {
            record
                .iter()
                .map(|value| {
                    value.parse::<f32>().with_context(|| {
                        format!("Invalid value {:?} on line {}", value, line + 1)
                    })
                })
                .collect::<Result<Vec<f32>>>()
        })
        .collect::<Result<Vec<_>>>()?;
    FeatureTable::from_rows(rows)
}

/// Load an ontology file of `<parent>\t<child>\t<type>` lines.
///
/// `default` lines are term -> term edges; any other type annotates the gene
/// `child` directly to `parent`. Genes missing from `gene2id` are skipped.
pub fn load_ontology<P: AsRef<Path>>(path: P, gene2id: &HashMap<String, usize>) -> Result<Ontology> {
    let path = path.as_ref();
    let ontology = parse_ontology(open(path)?, gene2id)
        .with_context(|| format!("Failed to load ontology from {:?}", path))?;
    info!(
        "Loaded ontology with {} terms and {} edges (root {})",
        ontology.node_count(),
        ontology.edge_count(),
        ontology.root()
    );
    Ok(ontology)
}

fn parse_ontology<R: Read>(reader: R, gene2id: &HashMap<String, usize>) -> Result<Ontology> {
    let mut term_edges = Vec::new();
    let mut term_direct_gene_map: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
    let mut skipped = 0usize;

    for (line, record) in read_records(reader, Delimiter::Tab, true)?.iter().enumerate() {
        let parent = field(record, 0, line)?;
        let child = field(record, 1, line)?;
        let kind = field(record, 2, line)?;

        if kind == TERM_EDGE_TYPE {
            term_edges.push((parent.to_string(), child.to_string()));
        } else if let Some(&gene_id) = gene2id.get(child) {
            term_direct_gene_map
                .entry(parent.to_string())
                .or_default()
                .insert(gene_id);
        } else {
            skipped += 1;
        }
    }

    if term_edges.is_empty() && term_direct_gene_map.is_empty() {
        bail!("Ontology file has no usable lines");
    }
    if skipped > 0 {
        debug!("Skipped {} annotations of genes outside the gene mapping", skipped);
    }
    Ontology::from_edges(&term_edges, term_direct_gene_map)
}
