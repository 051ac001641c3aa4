//! Admission policy decisions that need no I/O.

use chrono::{DateTime, Duration, Utc};
use refwatch_core::{BranchId, Build, RefEntry};
use std::collections::HashSet;

/// Commits older than this are never built.
pub const STALE_AFTER_DAYS: i64 = 30;

/// Whether a commit is too old to be admitted at `now`.
pub fn is_stale(commit_date: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    commit_date + Duration::days(STALE_AFTER_DAYS) < now
}

/// Order refs by most recent commit first, then by name.
pub fn sort_refs(refs: &mut [RefEntry]) {
    refs.sort_by(|a, b| {
        b.commit_date
            .cmp(&a.commit_date)
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Sequence a new build takes over from the pending builds it supersedes.
pub fn inherited_sequence(superseded: &[Build]) -> Option<i64> {
    superseded.iter().map(|b| b.sequence).min()
}

/// Pending builds that fall outside the admitted window of `running_max`.
///
/// `pending` is in ascending sequence. Builds on `sticky` branches are
/// admitted before all others, so a sticky build is only returned when
/// sticky builds alone exceed the cap.
pub fn over_capacity(
    pending: Vec<Build>,
    sticky: &HashSet<BranchId>,
    running_max: usize,
) -> Vec<Build> {
    if pending.len() <= running_max {
        return Vec::new();
    }
    let (mut window, others): (Vec<Build>, Vec<Build>) = pending
        .into_iter()
        .partition(|b| sticky.contains(&b.branch_id));
    window.extend(others);
    window.split_off(running_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use refwatch_core::{BranchId, BuildState, CommitInfo, NewBuild, RepositoryId};

    fn entry(name: &str, date: DateTime<Utc>) -> RefEntry {
        RefEntry {
            name: name.to_string(),
            commit_id: format!("{}-sha", name),
            commit_date: date,
            author: "Ada".to_string(),
            author_email: "ada@example.com".to_string(),
            subject: "Subject".to_string(),
            committer: "Ada".to_string(),
            committer_email: "ada@example.com".to_string(),
        }
    }

    fn pending(sequence: i64) -> Build {
        pending_on(BranchId::new(), sequence)
    }

    fn pending_on(branch_id: BranchId, sequence: i64) -> Build {
        NewBuild {
            repository_id: RepositoryId::for_url("https://gitlab.com/acme/app.git"),
            branch_id,
            commit_id: format!("sha{}", sequence),
            commit: CommitInfo {
                author: "Ada".to_string(),
                author_email: "ada@example.com".to_string(),
                committer: "Ada".to_string(),
                committer_email: "ada@example.com".to_string(),
                subject: "Subject".to_string(),
                date: Utc::now(),
            },
            state: BuildState::Pending,
            sequence,
            duplicate_of: None,
        }
        .into_build()
    }

    #[test]
    fn test_staleness_threshold() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(!is_stale(now - Duration::days(29), now));
        assert!(!is_stale(now - Duration::days(30), now));
        assert!(is_stale(now - Duration::days(31), now));
    }

    #[test]
    fn test_sort_refs_most_recent_first() {
        let now = Utc::now();
        let mut refs = vec![
            entry("refs/heads/old", now - Duration::days(3)),
            entry("refs/heads/new", now),
            entry("refs/heads/b-mid", now - Duration::days(1)),
            entry("refs/heads/a-mid", now - Duration::days(1)),
        ];
        sort_refs(&mut refs);

        let names: Vec<&str> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "refs/heads/new",
                "refs/heads/a-mid",
                "refs/heads/b-mid",
                "refs/heads/old"
            ]
        );
    }

    #[test]
    fn test_inherited_sequence_takes_lowest() {
        assert_eq!(inherited_sequence(&[]), None);
        assert_eq!(inherited_sequence(&[pending(7), pending(3), pending(5)]), Some(3));
    }

    fn sequences(builds: &[Build]) -> Vec<i64> {
        builds.iter().map(|b| b.sequence).collect()
    }

    #[test]
    fn test_over_capacity_drops_highest_sequences() {
        let queued = vec![pending(1), pending(2), pending(3)];
        let evicted = over_capacity(queued, &HashSet::new(), 2);
        assert_eq!(sequences(&evicted), vec![3]);

        let within = over_capacity(vec![pending(1), pending(2)], &HashSet::new(), 2);
        assert!(within.is_empty());
    }

    #[test]
    fn test_over_capacity_admits_sticky_builds_first() {
        let main = BranchId::new();
        let sticky = HashSet::from([main]);
        let pending = vec![pending(1), pending(2), pending_on(main, 3)];

        let evicted = over_capacity(pending, &sticky, 2);
        assert_eq!(sequences(&evicted), vec![2]);
    }

    #[test]
    fn test_over_capacity_evicts_sticky_when_they_alone_overflow() {
        let main = BranchId::new();
        let sticky = HashSet::from([main]);
        let pending = vec![pending_on(main, 1), pending(2), pending_on(main, 3)];

        let evicted = over_capacity(pending, &sticky, 1);
        assert_eq!(sequences(&evicted), vec![3, 2]);
    }
}
