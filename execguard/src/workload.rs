use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use serde::Serialize;

static LABEL_POD_TEMPLATE_HASH: &str = "pod-template-hash";
static LABEL_STATEFULSET_POD_NAME: &str = "statefulset.kubernetes.io/pod-name";
static LABEL_CONTROLLER_REVISION_HASH: &str = "controller-revision-hash";
static LABEL_JOB_NAME: &str = "job-name";
static LABEL_JOB_NAME_BATCH: &str = "batch.kubernetes.io/job-name";

/// Jobs spawned by a cronjob carry a unix-timestamp suffix in their name.
static CRONJOB_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.+)-\d{8,10}$").unwrap());

const RANDOM_SUFFIX_LEN: usize = 5;
/// Appended when a generated pod name was truncated by the 63-character
/// limit and the owning workload name cannot be recovered exactly.
const TRUNCATED_MARKER: &str = "-trnc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    Pod,
}

/// Infers the owning workload of a pod from its name and labels alone.
/// Pure function; the label keys, suffix lengths and the cronjob regex are
/// the contract relied on by policy-proposal consumers.
pub fn infer(pod_name: &str, labels: &BTreeMap<String, String>) -> (WorkloadKind, String) {
    if let Some(hash) = labels.get(LABEL_POD_TEMPLATE_HASH) {
        return (WorkloadKind::Deployment, deployment_name(pod_name, hash));
    }

    if labels.contains_key(LABEL_STATEFULSET_POD_NAME) {
        let name = match pod_name.rsplit_once('-') {
            Some((stem, _ordinal)) => stem.to_string(),
            None => pod_name.to_string(),
        };
        return (WorkloadKind::StatefulSet, name);
    }

    if labels.contains_key(LABEL_CONTROLLER_REVISION_HASH) {
        return (WorkloadKind::DaemonSet, trim_random_suffix(pod_name));
    }

    let job_name = labels
        .get(LABEL_JOB_NAME)
        .or_else(|| labels.get(LABEL_JOB_NAME_BATCH));
    if let Some(job_name) = job_name {
        if let Some(captures) = CRONJOB_RE.captures(job_name) {
            return (WorkloadKind::CronJob, captures[1].to_string());
        }
        return (WorkloadKind::Job, job_name.to_string());
    }

    (WorkloadKind::Pod, pod_name.to_string())
}

/// Splits off a trailing `-xxxxx` random suffix if present.
fn split_random_suffix(name: &str) -> Option<(&str, &str)> {
    let (stem, suffix) = name.rsplit_once('-')?;
    if suffix.len() == RANDOM_SUFFIX_LEN && !stem.is_empty() {
        Some((stem, suffix))
    } else {
        None
    }
}

/// Deployment pods are named `<deployment>-<template-hash>-<5 random>`. The
/// template hash may have been truncated together with the deployment name
/// to fit the 63-character pod-name limit, so a prefix of five or more
/// characters of the label value also counts as a match. When the hash
/// segment collapsed entirely, the best we can return is the stem with a
/// truncation marker.
fn deployment_name(pod_name: &str, hash: &str) -> String {
    let Some((stem, _random)) = split_random_suffix(pod_name) else {
        return format!("{pod_name}{TRUNCATED_MARKER}");
    };

    if let Some(base) = stem.strip_suffix(hash).and_then(|s| s.strip_suffix('-')) {
        return base.to_string();
    }

    if let Some((base, segment)) = stem.rsplit_once('-') {
        if segment.len() >= RANDOM_SUFFIX_LEN && hash.starts_with(segment) {
            return base.to_string();
        }
    }

    format!("{stem}{TRUNCATED_MARKER}")
}

/// DaemonSet pods are named `<daemonset>-<5 random>`.
fn trim_random_suffix(pod_name: &str) -> String {
    match split_random_suffix(pod_name) {
        Some((stem, _random)) => stem.to_string(),
        None => format!("{pod_name}{TRUNCATED_MARKER}"),
    }
}
