//! End-to-end decoding scenarios over a synthetic acoustic world.
//!
//! Each CI phone gets its own one-density codebook whose mean encodes a
//! distinct energy level, and "audio" is a sequence of cepstral frames
//! sitting on those levels. That keeps the acoustics unambiguous so the
//! tests exercise the search machinery, not Gaussian luck.
use ndarray::Array2;
use std::io;
use std::sync::Arc;
use xd_asr::decoder::Models;
use xd_asr::dict::{Dictionary, WordId};
use xd_asr::error::DecodeError;
use xd_asr::gauden::Gauden;
use xd_asr::lm::TableLmBuilder;
use xd_asr::mdef::ModelDefBuilder;
use xd_asr::senone::SenoneSet;
use xd_asr::{Decoder, DecoderConfig, LogMath};

const PHONES: &[(&str, f32)] = &[
    ("SIL", 0.0),
    ("F", 4.0),
    ("AY", 8.0),
    ("V", 12.0),
    ("N", 16.0),
    ("HH", 20.0),
    ("EH", 24.0),
    ("L", 28.0),
    ("OW", 32.0),
    ("W", 36.0),
    ("ER", 40.0),
    ("D", 44.0),
    ("G", 48.0),
    ("AO", 52.0),
    ("R", 56.0),
    ("T", 60.0),
    ("M", 64.0),
    ("IY", 68.0),
    ("Z", 72.0),
];

const DICT: &str = "\
FIVE F AY V
NINE N AY N
HELLO HH EH L OW
WORLD W ER L D
GO G OW
FORWARD F AO R W ER D
TEN T EH N
METERS M IY T ER Z
";

const FILLERS: &str = "<sil> SIL\n";

fn config() -> DecoderConfig {
    DecoderConfig {
        n_cep: 1,
        cmn: false,
        n_top: 1,
        frame_cache: 512,
        ..Default::default()
    }
}

fn models(config: &DecoderConfig) -> Models {
    let logmath = LogMath::new(config.logbase).unwrap();
    let mut builder = ModelDefBuilder::new(3);
    let tmat = builder
        .add_tmat(vec![
            vec![0.5, 0.5, 0.0, 0.0],
            vec![0.0, 0.5, 0.5, 0.0],
            vec![0.0, 0.0, 0.5, 0.5],
        ])
        .unwrap();
    let mut sen = 0u32;
    for (name, _) in PHONES {
        builder
            .add_ciphone(name, *name == "SIL", vec![sen, sen + 1, sen + 2], tmat)
            .unwrap();
        sen += 3;
    }
    let mdef = builder.build(&logmath).unwrap();

    let dict = Arc::new(
        Dictionary::from_readers(
            mdef.clone(),
            io::Cursor::new(DICT),
            Some(io::Cursor::new(FILLERS)),
        )
        .unwrap(),
    );

    // One codebook per phone: a single density at the phone's level, flat
    // over the delta dimensions. All three senones of a phone share it.
    let mut means = Vec::new();
    let mut vars = Vec::new();
    let mut sen2cb = Vec::new();
    for (cb, (_, level)) in PHONES.iter().enumerate() {
        means.push(Array2::from_shape_vec((1, 3), vec![*level, 0.0, 0.0]).unwrap());
        vars.push(Array2::from_elem((1, 3), 1.0));
        sen2cb.extend([cb as u32; 3]);
    }
    let gauden = Gauden::new(logmath.clone(), means, vars, 1e-4).unwrap();
    let weights = Array2::from_elem((PHONES.len() * 3, 1), 1.0f32);
    let senones = SenoneSet::from_linear(&logmath, weights, sen2cb).unwrap();

    let mut lm = TableLmBuilder::new(logmath, 1.0, 1.0);
    lm.unigram("<s>", 0.1, 1.0).unigram("</s>", 0.1, 1.0);
    for w in ["FIVE", "NINE", "HELLO", "WORLD", "GO", "FORWARD", "TEN", "METERS"] {
        lm.unigram(w, 0.1, 1.0);
    }
    lm.bigram("<s>", "HELLO", 0.4, 1.0)
        .bigram("HELLO", "WORLD", 0.4, 1.0)
        .bigram("WORLD", "</s>", 0.4, 1.0)
        .bigram("<s>", "FIVE", 0.4, 1.0)
        .bigram("FIVE", "</s>", 0.4, 1.0);

    Models {
        mdef,
        dict,
        gauden,
        senones,
        lm: lm.build(),
    }
}

fn decoder_with(config: DecoderConfig) -> Decoder {
    let models = models(&config);
    Decoder::new(config, models).unwrap()
}

fn level_of(phone: &str) -> f32 {
    PHONES.iter().find(|(n, _)| *n == phone).unwrap().1
}

/// Synthetic cepstra: `per` frames per listed phone.
fn frames_for(phones: &[&str], per: usize) -> Vec<Vec<f32>> {
    let mut out = Vec::new();
    for p in phones {
        for _ in 0..per {
            out.push(vec![level_of(p)]);
        }
    }
    out
}

#[test]
fn decodes_a_single_word() {
    let mut d = decoder_with(config());
    let frames = frames_for(&["SIL", "F", "AY", "V", "SIL"], 10);
    d.start_utt().unwrap();
    d.process_cep(&frames).unwrap();
    d.end_utt().unwrap();

    let hyp = d.hypothesis().expect("a hypothesis");
    assert_eq!(hyp.text, "FIVE");
    let words: Vec<_> = d
        .seg_iter()
        .filter(|s| !d.dict().is_filler(s.wid))
        .collect();
    assert_eq!(words.len(), 1);
    let five = &words[0];
    // The word sits in the middle of the clip, give or take the boundary
    // frames the search may trade with silence.
    assert!(five.sf >= 5 && five.sf <= 15, "sf = {}", five.sf);
    assert!(five.ef >= 35 && five.ef <= 45, "ef = {}", five.ef);
}

#[test]
fn silence_only_yields_no_real_words() {
    let mut d = decoder_with(config());
    let frames = frames_for(&["SIL"], 50);
    d.start_utt().unwrap();
    d.process_cep(&frames).unwrap();
    match d.end_utt() {
        Ok(()) => {
            let hyp = d.hypothesis().expect("a hypothesis");
            assert_eq!(hyp.text, "", "expected only fillers, got {}", hyp.text);
        }
        Err(DecodeError::EmptyUtterance) => {}
        Err(e) => panic!("unexpected error {e}"),
    }
}

#[test]
fn decodes_a_two_word_phrase_with_lattice_and_nbest() {
    let mut d = decoder_with(config());
    let frames = frames_for(
        &["SIL", "HH", "EH", "L", "OW", "W", "ER", "L", "D", "SIL"],
        10,
    );
    d.start_utt().unwrap();
    d.process_cep(&frames).unwrap();
    d.end_utt().unwrap();

    let hyp = d.hypothesis().expect("a hypothesis");
    assert_eq!(hyp.text, "HELLO WORLD");

    // The lattice holds the path <s> -> HELLO -> WORLD -> </s>.
    let lat = d.lattice().expect("a lattice");
    let node_words: Vec<&str> = (0..lat.n_nodes() as u32)
        .map(|n| d.dict().text(lat.node(n).wid))
        .collect();
    assert!(node_words.contains(&"HELLO"));
    assert!(node_words.contains(&"WORLD"));

    // Link posteriors out of the start node are a probability distribution.
    let lmath = d.logmath().clone();
    let start = lat.start();
    let mut total = 0.0f64;
    for &l in &lat.node(start).out_links {
        if !lat.link(l).suppressed {
            total += lmath.exp(lat.posterior(l));
        }
    }
    assert!((total - 1.0).abs() < 1e-2, "posterior sum {total}");

    // N-best: rank 1 is the hypothesis, scores never increase.
    let hyps: Vec<_> = d.nbest_iter(0).expect("nbest").take(3).collect();
    assert!(!hyps.is_empty());
    assert_eq!(hyps[0].text, "HELLO WORLD");
    for pair in hyps.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }

    assert!(d.probability().is_some());
}

#[test]
fn flat_rescoring_pass_agrees() {
    let mut config = config();
    config.flat_rescore = true;
    let mut d = decoder_with(config);
    let frames = frames_for(
        &["SIL", "HH", "EH", "L", "OW", "W", "ER", "L", "D", "SIL"],
        10,
    );
    d.start_utt().unwrap();
    d.process_cep(&frames).unwrap();
    d.end_utt().unwrap();
    let hyp = d.hypothesis().expect("a hypothesis");
    assert_eq!(hyp.text, "HELLO WORLD");
}

#[test]
fn partial_hypothesis_mid_utterance() {
    let mut d = decoder_with(config());
    let frames = frames_for(&["SIL", "F", "AY", "V"], 10);
    d.start_utt().unwrap();
    d.process_cep(&frames).unwrap();
    assert!(d.in_speech());
    // Something has exited by now, if only silence.
    assert!(d.partial_hypothesis().is_some());
    d.process_cep(&frames_for(&["SIL"], 10)).unwrap();
    d.end_utt().unwrap();
    assert!(!d.in_speech());
    assert_eq!(d.hypothesis().unwrap().text, "FIVE");
}

#[test]
fn forced_alignment_of_matching_transcript() {
    let mut d = decoder_with(config());
    d.set_align_text("GO FORWARD TEN METERS").unwrap();
    let frames = frames_for(
        &[
            "G", "OW", // GO
            "F", "AO", "R", "W", "ER", "D", // FORWARD
            "T", "EH", "N", // TEN
            "M", "IY", "T", "ER", "Z", // METERS
        ],
        8,
    );
    let n_frames = frames.len() as i32;
    d.start_utt().unwrap();
    d.process_cep(&frames).unwrap();
    d.end_utt().unwrap();

    let segs: Vec<_> = d.seg_iter().collect();
    assert_eq!(segs.len(), 4);
    let words: Vec<&str> = segs.iter().map(|s| s.word.as_str()).collect();
    assert_eq!(words, vec!["GO", "FORWARD", "TEN", "METERS"]);
    // Monotone, contiguous, spanning the whole utterance.
    assert_eq!(segs[0].sf, 0);
    for pair in segs.windows(2) {
        assert_eq!(pair[1].sf, pair[0].ef + 1);
    }
    assert_eq!(segs.last().unwrap().ef, n_frames - 1);

    // Phone durations sum to the audio length.
    let al = d.alignment().expect("alignment");
    let phone_total: i32 = al.phones().iter().map(|p| p.duration).sum();
    assert_eq!(phone_total, n_frames);
    // And state durations to their phone's.
    for (i, phone) in al.phones().iter().enumerate() {
        let state_total: i32 = al
            .states()
            .iter()
            .filter(|s| s.phone == i)
            .map(|s| s.duration)
            .sum();
        assert_eq!(state_total, phone.duration);
    }
}

#[test]
fn impossible_alignment_leaves_session_usable() {
    let mut d = decoder_with(config());
    let transcript = vec!["HELLO"; 20].join(" ");
    d.set_align_text(&transcript).unwrap();
    d.start_utt().unwrap();
    // 50 frames cannot fit 80 phones.
    d.process_cep(&frames_for(&["HH"], 50)).unwrap();
    match d.end_utt() {
        Err(DecodeError::AlignmentImpossible) => {}
        other => panic!("expected AlignmentImpossible, got {other:?}"),
    }
    assert!(d.alignment().is_none());

    // The session is still good for a normal decode.
    d.set_search(xd_asr::decoder::DEFAULT_SEARCH).unwrap();
    let frames = frames_for(&["SIL", "F", "AY", "V", "SIL"], 10);
    d.start_utt().unwrap();
    d.process_cep(&frames).unwrap();
    d.end_utt().unwrap();
    assert_eq!(d.hypothesis().unwrap().text, "FIVE");
}

#[test]
fn teed_scores_replay_to_the_same_result() {
    let dir = std::env::temp_dir().join(format!("xd-asr-tee-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let tee = dir.join("scores.npy");

    let mut config_tee = config();
    config_tee.senone_tee = Some(tee.clone());
    let mut d = decoder_with(config_tee);
    let frames = frames_for(&["SIL", "F", "AY", "V", "SIL"], 10);
    d.start_utt().unwrap();
    d.process_cep(&frames).unwrap();
    d.end_utt().unwrap();
    let first = d.hypothesis().unwrap();

    let mut config_replay = config();
    config_replay.senone_replay = Some(tee.clone());
    let mut d2 = decoder_with(config_replay);
    d2.start_utt().unwrap();
    d2.process_cep(&frames).unwrap();
    d2.end_utt().unwrap();
    let second = d2.hypothesis().unwrap();

    assert_eq!(first.text, second.text);
    assert_eq!(first.score, second.score);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn poor_acoustics_still_pick_the_closest_word() {
    // NINE and FIVE share AY; the flanks decide.
    let mut d = decoder_with(config());
    let frames = frames_for(&["SIL", "N", "AY", "N", "SIL"], 10);
    d.start_utt().unwrap();
    d.process_cep(&frames).unwrap();
    d.end_utt().unwrap();
    assert_eq!(d.hypothesis().unwrap().text, "NINE");
}

#[test]
fn rejects_mismatched_models() {
    let config = config();
    let mut m = models(&config);
    // Chop the mixture weights down so they no longer cover the senones.
    let logmath = LogMath::new(config.logbase).unwrap();
    m.senones =
        SenoneSet::from_linear(&logmath, Array2::from_elem((3, 1), 1.0f32), vec![0, 0, 0])
            .unwrap();
    match Decoder::new(config, m) {
        Err(DecodeError::ModelMismatch(_)) => {}
        other => panic!("expected ModelMismatch, got {other:?}"),
    }
}

#[test]
fn word_ids_expose_base_variants() {
    let d = decoder_with(config());
    let dict = d.dict();
    let five = dict.word_id("FIVE").unwrap();
    assert_eq!(dict.base_wid(five), five);
    assert!((0..dict.len() as WordId).any(|w| dict.is_filler(w)));
}
