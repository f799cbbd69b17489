//! Batch/v1 Job adapter
//!
//! Wraps `k8s_openapi::api::batch::v1::Job` in the [`QueueableJob`]
//! capability set. A batch Job projects a single pod set named `main`;
//! partial admission is declared through the min-parallelism annotation and
//! applied by overriding `spec.parallelism` on resume.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use super::{min_parallelism, JobOutcome, QueueableJob};
use crate::crd::PodSet;
use crate::podset::{self, PodSetInfo};
use crate::{Error, Result, DEFAULT_POD_SET_NAME};

/// Terminal condition type reported by a completed batch Job.
const JOB_COMPLETE: &str = "Complete";
/// Terminal condition type reported by a failed batch Job.
const JOB_FAILED: &str = "Failed";

/// `batch/v1` Job seen through the queueing capability set.
#[derive(Clone, Debug)]
pub struct BatchJob(pub Job);

impl BatchJob {
    fn parallelism(&self) -> i32 {
        self.0
            .spec
            .as_ref()
            .and_then(|s| s.parallelism)
            .unwrap_or(0)
    }
}

impl QueueableJob for BatchJob {
    type Object = Job;

    fn from_object(object: Job) -> Self {
        Self(object)
    }

    fn object(&self) -> &Job {
        &self.0
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.0.metadata
    }

    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: "batch/v1".to_string(),
            kind: "Job".to_string(),
            name: self.0.metadata.name.clone().unwrap_or_default(),
            uid: self.0.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn is_suspended(&self) -> bool {
        self.0
            .spec
            .as_ref()
            .and_then(|s| s.suspend)
            .unwrap_or(false)
    }

    fn suspend(&mut self) {
        self.0.spec.get_or_insert_with(Default::default).suspend = Some(true);
    }

    fn run_with_pod_set_infos(&mut self, infos: &[PodSetInfo]) -> Result<()> {
        let has_min = min_parallelism(&self.0.metadata).is_some();
        let spec = self.0.spec.get_or_insert_with(Default::default);
        spec.suspend = Some(false);

        if infos.len() != 1 {
            return Err(Error::InvalidPodSetInfoCount {
                want: 1,
                got: infos.len(),
            });
        }
        let info = &infos[0];

        if has_min {
            spec.parallelism = Some(info.count);
        }

        let meta = spec.template.metadata.get_or_insert_with(Default::default);
        let pod_spec = spec.template.spec.get_or_insert_with(Default::default);
        podset::merge(meta, pod_spec, info)
    }

    fn restore_pod_set_infos(&mut self, infos: &[PodSetInfo]) -> bool {
        if infos.len() != 1 {
            return false;
        }
        let info = &infos[0];
        let Some(spec) = self.0.spec.as_mut() else {
            return false;
        };

        let mut changed = false;
        if spec.parallelism != Some(info.count) {
            spec.parallelism = Some(info.count);
            changed = true;
        }

        let meta = spec.template.metadata.get_or_insert_with(Default::default);
        let pod_spec = spec.template.spec.get_or_insert_with(Default::default);
        changed = podset::restore(meta, pod_spec, info) || changed;
        changed
    }

    fn pod_sets(&self) -> Vec<PodSet> {
        let template = self
            .0
            .spec
            .as_ref()
            .map(|s| s.template.clone())
            .unwrap_or_else(PodTemplateSpec::default);
        vec![PodSet {
            name: DEFAULT_POD_SET_NAME.to_string(),
            template,
            count: self.0.spec.as_ref().and_then(|s| s.parallelism).unwrap_or(1),
            min_count: min_parallelism(&self.0.metadata),
        }]
    }

    fn pods_ready(&self) -> bool {
        let parallelism = self.parallelism();
        if parallelism == 0 {
            return false;
        }
        let completions = self.0.spec.as_ref().and_then(|s| s.completions);
        let threshold = match completions {
            Some(completions) => parallelism.min(completions),
            None => parallelism,
        };

        let status = self.0.status.as_ref();
        let ready = status.and_then(|s| s.ready).unwrap_or(0);
        let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
        ready + succeeded >= threshold
    }

    fn is_active(&self) -> bool {
        self.0
            .status
            .as_ref()
            .and_then(|s| s.active)
            .unwrap_or(0)
            > 0
    }

    fn finished(&self) -> Option<JobOutcome> {
        let conditions = self.0.status.as_ref()?.conditions.as_ref()?;
        conditions
            .iter()
            .find(|c| (c.type_ == JOB_COMPLETE || c.type_ == JOB_FAILED) && c.status == "True")
            .map(|c| {
                let succeeded = c.type_ == JOB_COMPLETE;
                JobOutcome {
                    succeeded,
                    message: if succeeded {
                        "Job finished successfully".to_string()
                    } else {
                        "Job failed".to_string()
                    },
                }
            })
    }

    fn priority_class(&self) -> Option<String> {
        self.0
            .spec
            .as_ref()?
            .template
            .spec
            .as_ref()?
            .priority_class_name
            .clone()
    }

    fn clear_start_time(&mut self) -> bool {
        self.0
            .status
            .as_mut()
            .and_then(|s| s.start_time.take())
            .is_some()
    }
}
