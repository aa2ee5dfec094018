/// Minimal ordered diff between two identity sequences.
///
/// `removals` are indexes into the old sequence in *descending* order;
/// `insertions` are indexes into the new sequence in *ascending* order.
/// Applying all removals, then all insertions, transforms the old sequence
/// into the new one with earlier indexes staying valid throughout.
///
/// A retained identity that changed relative position shows up in both
/// lists; the engine re-inserts the existing instance, it never replaces it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct KeyedDiff {
    pub removals: Vec<usize>,
    pub insertions: Vec<usize>,
}

/// Cap on the LCS table after prefix/suffix trimming. Beyond this the diff
/// degrades to coarse remove-all/insert-all for the trimmed middle, trading
/// event minimality for bounded memory.
const LCS_CELL_CAP: usize = 1 << 20;

pub(crate) fn diff_keys<K: PartialEq>(old: &[K], new: &[K]) -> KeyedDiff {
    // Common prefix/suffix carry no events; trim them before the DP.
    let mut prefix = 0;
    while prefix < old.len() && prefix < new.len() && old[prefix] == new[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old.len() - prefix
        && suffix < new.len() - prefix
        && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let (kept_old, kept_new) = if old_mid.is_empty() || new_mid.is_empty() {
        (Vec::new(), Vec::new())
    } else if old_mid.len().saturating_mul(new_mid.len()) > LCS_CELL_CAP {
        rwarn!(
            old = old_mid.len(),
            new = new_mid.len(),
            "diff_keys: LCS table too large, degrading to coarse replace"
        );
        (Vec::new(), Vec::new())
    } else {
        lcs_pairs(old_mid, new_mid)
    };

    let mut removals = Vec::with_capacity(old_mid.len() - kept_old.len());
    let mut kept = kept_old.iter().copied().peekable();
    for i in 0..old_mid.len() {
        if kept.peek() == Some(&i) {
            kept.next();
        } else {
            removals.push(prefix + i);
        }
    }
    removals.reverse();

    let mut insertions = Vec::with_capacity(new_mid.len() - kept_new.len());
    let mut kept = kept_new.iter().copied().peekable();
    for j in 0..new_mid.len() {
        if kept.peek() == Some(&j) {
            kept.next();
        } else {
            insertions.push(prefix + j);
        }
    }

    KeyedDiff {
        removals,
        insertions,
    }
}

/// Classic LCS DP + backtrack. Returns the kept index pairs (ascending) as
/// separate old/new index lists.
fn lcs_pairs<K: PartialEq>(old: &[K], new: &[K]) -> (Vec<usize>, Vec<usize>) {
    let n = old.len();
    let m = new.len();
    // (n+1) x (m+1), row-major.
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * (m + 1) + j] = if old[i] == new[j] {
                table[(i + 1) * (m + 1) + j + 1] + 1
            } else {
                table[(i + 1) * (m + 1) + j].max(table[i * (m + 1) + j + 1])
            };
        }
    }

    let mut kept_old = Vec::new();
    let mut kept_new = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            kept_old.push(i);
            kept_new.push(j);
            i += 1;
            j += 1;
        } else if table[(i + 1) * (m + 1) + j] >= table[i * (m + 1) + j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    (kept_old, kept_new)
}
