/// Property tests: replicas that see the same operations end up identical,
/// whatever order the operations arrive in
use coedit::*;
use proptest::prelude::*;

const SEED: &str = "abcdef";

#[derive(Debug, Clone)]
enum Edit {
    Insert { at: usize, text: String },
    Delete { at: usize, len: usize },
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (any::<usize>(), "[a-z]{1,3}").prop_map(|(at, text)| Edit::Insert { at, text }),
        (any::<usize>(), 1usize..4).prop_map(|(at, len)| Edit::Delete { at, len }),
    ]
}

fn replica(site: &str) -> CrdtEngine {
    let document = Document::with_content("doc", SEED, SiteId::from("seed"));
    CrdtEngine::with_document(SiteId::from(site), document, CrdtConfig::default())
}

/// Apply a scripted edit, mapping the random numbers onto valid coordinates
fn perform(engine: &mut CrdtEngine, edit: &Edit) -> Option<Operation> {
    let len = engine.document().len();
    match edit {
        Edit::Insert { at, text } => engine.insert_text(at % (len + 1), text).ok(),
        Edit::Delete { at, len: want } => {
            if len == 0 {
                return None;
            }
            let position = at % len;
            let length = (*want).min(len - position);
            engine.delete_text(position, length).ok()
        }
    }
}

/// Two rounds of edits from three sites. Between rounds the first site hears
/// everything, so its second-round edits causally depend on the others.
fn generate(rounds: &[Vec<Vec<Edit>>]) -> Vec<Operation> {
    let mut sites = vec![replica("s0"), replica("s1"), replica("s2")];
    let mut all = Vec::new();

    for round in rounds {
        for (site, script) in sites.iter_mut().zip(round) {
            for edit in script {
                if let Some(op) = perform(site, edit) {
                    all.push(op);
                }
            }
        }
        for op in all.clone() {
            sites[0].apply_remote_operation(op).unwrap();
        }
    }
    all
}

fn deliver(ops: &[Operation]) -> CrdtEngine {
    let mut engine = replica("reader");
    for op in ops {
        engine.apply_remote_operation(op.clone()).unwrap();
    }
    engine
}

fn scripts() -> impl Strategy<Value = Vec<Vec<Vec<Edit>>>> {
    prop::collection::vec(
        prop::collection::vec(prop::collection::vec(edit(), 0..4), 3),
        2,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_delivery_order_does_not_matter(rounds in scripts(), seed in any::<u64>()) {
        let ops = generate(&rounds);

        let in_order = deliver(&ops);
        let mut reversed_ops = ops.clone();
        reversed_ops.reverse();
        let reversed = deliver(&reversed_ops);

        // Deterministic shuffle driven by the generated seed
        let mut shuffled_ops = ops.clone();
        let mut state = seed | 1;
        for i in (1..shuffled_ops.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            shuffled_ops.swap(i, (state % (i as u64 + 1)) as usize);
        }
        let shuffled = deliver(&shuffled_ops);

        prop_assert_eq!(in_order.buffered_count(), 0);
        prop_assert_eq!(reversed.buffered_count(), 0);
        prop_assert_eq!(shuffled.buffered_count(), 0);
        prop_assert_eq!(in_order.content(), reversed.content());
        prop_assert_eq!(in_order.content(), shuffled.content());
        prop_assert!(in_order.document().verify_integrity());
    }

    #[test]
    fn prop_author_matches_reader(rounds in scripts()) {
        let mut author = replica("s0");
        let mut ops = Vec::new();
        for script in rounds.iter().map(|round| &round[0]) {
            for edit in script {
                if let Some(op) = perform(&mut author, edit) {
                    ops.push(op);
                }
            }
        }

        let reader = deliver(&ops);
        prop_assert_eq!(author.content(), reader.content());
    }

    #[test]
    fn prop_redelivery_is_idempotent(rounds in scripts()) {
        let ops = generate(&rounds);
        let mut engine = deliver(&ops);
        let before = engine.content().to_string();
        let log_len = engine.document().operations().len();

        for op in &ops {
            prop_assert!(engine.apply_remote_operation(op.clone()).unwrap().is_empty());
        }
        prop_assert_eq!(engine.content(), before.as_str());
        prop_assert_eq!(engine.document().operations().len(), log_len);
    }
}
