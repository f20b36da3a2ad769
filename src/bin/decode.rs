use clap::Parser;
use hound::WavReader;
use ndarray::Array2;
use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use xd_asr::acmod::EnergyFrontEnd;
use xd_asr::decoder::Models;
use xd_asr::dict::Dictionary;
use xd_asr::gauden::Gauden;
use xd_asr::lm::TableLmBuilder;
use xd_asr::mdef::{ModelDefBuilder, WordPosition};
use xd_asr::senone::SenoneSet;
use xd_asr::*;

#[derive(Parser, Debug)]
pub struct Args {
    /// Decoder configuration (JSON); defaults are used when omitted
    #[clap(long)]
    config: Option<PathBuf>,
    /// Acoustic model and LM description (JSON)
    #[clap(long)]
    model: PathBuf,
    /// Pronunciation dictionary
    #[clap(long)]
    dict: PathBuf,
    /// Filler dictionary
    #[clap(long)]
    fillers: Option<PathBuf>,
    /// Cepstral frames to decode, a frames x n_cep f32 .npy matrix
    #[clap(long)]
    cepstra: Option<PathBuf>,
    /// 16-bit mono wav to decode through the toy energy front end
    #[clap(long)]
    wav: Option<PathBuf>,
    /// Force-align against this transcript instead of decoding
    #[clap(long)]
    align: Option<String>,
    /// Print this many n-best hypotheses
    #[clap(long, default_value_t = 0)]
    nbest: usize,
    /// Write a text dump of the word lattice here
    #[clap(long)]
    lattice_out: Option<PathBuf>,
}

/// On-disk description of a model set. A stand-in for real model file
/// readers, which live outside this crate.
#[derive(Debug, Deserialize)]
struct ModelSpec {
    n_emit: usize,
    /// Transition matrices as linear probabilities, n_emit rows of
    /// n_emit + 1.
    tmats: Vec<Vec<Vec<f64>>>,
    ciphones: Vec<CiPhoneSpec>,
    #[serde(default)]
    triphones: Vec<TriphoneSpec>,
    #[serde(default = "default_var_floor")]
    var_floor: f32,
    /// Codebooks of (means, variances), each density x dim.
    codebooks: Vec<CodebookSpec>,
    /// Linear mixture weights, senone x density.
    mixture_weights: Vec<Vec<f32>>,
    /// Codebook of each senone; all zero for semi-continuous models.
    sen2cb: Vec<u32>,
    lm: LmSpec,
}

fn default_var_floor() -> f32 {
    1e-4
}

#[derive(Debug, Deserialize)]
struct CiPhoneSpec {
    name: String,
    #[serde(default)]
    filler: bool,
    senones: Vec<u32>,
    tmat: usize,
}

#[derive(Debug, Deserialize)]
struct TriphoneSpec {
    base: String,
    lc: String,
    rc: String,
    position: String,
    senones: Vec<u32>,
    tmat: usize,
}

#[derive(Debug, Deserialize)]
struct CodebookSpec {
    means: Vec<Vec<f32>>,
    variances: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct LmSpec {
    #[serde(default = "default_one")]
    language_weight: f64,
    #[serde(default = "default_one")]
    word_insertion_penalty: f64,
    /// (word, probability, backoff weight)
    unigrams: Vec<(String, f64, f64)>,
    #[serde(default)]
    bigrams: Vec<(String, String, f64, f64)>,
    #[serde(default)]
    trigrams: Vec<(String, String, String, f64)>,
}

fn default_one() -> f64 {
    1.0
}

fn word_position(s: &str) -> anyhow::Result<WordPosition> {
    Ok(match s {
        "b" => WordPosition::Begin,
        "i" => WordPosition::Internal,
        "e" => WordPosition::End,
        "s" => WordPosition::Single,
        other => anyhow::bail!("unknown word position {other}"),
    })
}

fn build_models(
    spec: ModelSpec,
    config: &DecoderConfig,
    dict_path: &PathBuf,
    fillers: Option<&PathBuf>,
) -> anyhow::Result<Models> {
    let logmath = LogMath::new(config.logbase)?;

    let mut builder = ModelDefBuilder::new(spec.n_emit);
    let mut tmats = Vec::new();
    for t in spec.tmats {
        tmats.push(builder.add_tmat(t)?);
    }
    for ci in &spec.ciphones {
        builder.add_ciphone(&ci.name, ci.filler, ci.senones.clone(), tmats[ci.tmat])?;
    }
    // CI ids are assigned in declaration order.
    let ci_id = |name: &str| -> anyhow::Result<u16> {
        spec.ciphones
            .iter()
            .position(|c| c.name == name)
            .map(|i| i as u16)
            .ok_or_else(|| anyhow::anyhow!("unknown CI phone {name}"))
    };
    for tri in &spec.triphones {
        builder.add_triphone(
            ci_id(&tri.base)?,
            ci_id(&tri.lc)?,
            ci_id(&tri.rc)?,
            word_position(&tri.position)?,
            tri.senones.clone(),
            tmats[tri.tmat],
        )?;
    }
    let mdef = builder.build(&logmath)?;

    let dict = Arc::new(Dictionary::open(
        mdef.clone(),
        dict_path,
        fillers.map(|f| f.as_path()),
    )?);

    let to_array = |rows: &Vec<Vec<f32>>| -> anyhow::Result<Array2<f32>> {
        let n = rows.len();
        let d = rows.first().map(|r| r.len()).unwrap_or(0);
        Ok(Array2::from_shape_vec(
            (n, d),
            rows.iter().flatten().copied().collect(),
        )?)
    };
    let mut means = Vec::new();
    let mut vars = Vec::new();
    for cb in &spec.codebooks {
        means.push(to_array(&cb.means)?);
        vars.push(to_array(&cb.variances)?);
    }
    let gauden = Gauden::new(logmath.clone(), means, vars, spec.var_floor)?;
    let senones = SenoneSet::from_linear(&logmath, to_array(&spec.mixture_weights)?, spec.sen2cb)?;

    let mut lm = TableLmBuilder::new(
        logmath,
        spec.lm.language_weight,
        spec.lm.word_insertion_penalty,
    );
    for (w, p, bo) in &spec.lm.unigrams {
        lm.unigram(w, *p, *bo);
    }
    for (h, w, p, bo) in &spec.lm.bigrams {
        lm.bigram(h, w, *p, *bo);
    }
    for (h1, h0, w, p) in &spec.lm.trigrams {
        lm.trigram(h1, h0, w, *p);
    }

    Ok(Models {
        mdef,
        dict,
        gauden,
        senones,
        lm: lm.build(),
    })
}

fn main() -> anyhow::Result<()> {
    xd_asr::setup_logging();
    let args = Args::parse();

    let config: DecoderConfig = match &args.config {
        Some(path) => serde_json::from_reader(BufReader::new(File::open(path)?))?,
        None => DecoderConfig::default(),
    };
    let spec: ModelSpec = serde_json::from_reader(BufReader::new(File::open(&args.model)?))?;
    let models = build_models(spec, &config, &args.dict, args.fillers.as_ref())?;

    let mut decoder = Decoder::new(config, models)?;
    if let Some(transcript) = &args.align {
        decoder.set_align_text(transcript)?;
    }

    decoder.start_utt()?;
    match (&args.cepstra, &args.wav) {
        (Some(path), _) => {
            let m: Array2<f32> = ndarray_npy::read_npy(path)?;
            let frames: Vec<Vec<f32>> = m.rows().into_iter().map(|r| r.to_vec()).collect();
            info!(frames = frames.len(), "decoding cepstra");
            decoder.process_cep(&frames)?;
        }
        (None, Some(path)) => {
            let mut reader = WavReader::open(path)?;
            let rate = reader.spec().sample_rate as usize;
            decoder.set_front_end(Box::new(EnergyFrontEnd::new(rate)));
            let samples: Vec<i16> = reader.samples::<i16>().collect::<std::result::Result<_, _>>()?;
            info!(samples = samples.len(), rate, "decoding audio");
            decoder.process_raw(&samples)?;
        }
        (None, None) => anyhow::bail!("one of --cepstra or --wav is required"),
    }
    decoder.end_utt()?;

    match decoder.hypothesis() {
        Some(hyp) => println!("{} ({})", hyp.text, hyp.score),
        None => println!("(no hypothesis)"),
    }
    for seg in decoder.seg_iter() {
        println!(
            "  {:<20} {:>5} {:>5} ascr {:>10} lscr {:>10}",
            seg.word, seg.sf, seg.ef, seg.ascr, seg.lscr
        );
    }
    if args.nbest > 0 {
        if let Some(nbest) = decoder.nbest_iter(0) {
            for (i, hyp) in nbest.take(args.nbest).enumerate() {
                println!("#{:<3} {} ({})", i + 1, hyp.text, hyp.score);
            }
        }
    }
    if let Some(path) = &args.lattice_out {
        if let Some(lattice) = decoder.lattice() {
            let mut out = io::BufWriter::new(File::create(path)?);
            lattice.dump(&mut out)?;
            info!(?path, "lattice written");
        }
    }
    Ok(())
}
