// Copyright 2025 The EtcdProxy Controller Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::KubeSchema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, Default, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    /// The etcd-proxy Deployment and the Service exposing it are created.
    Deployed,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    /// Last time the condition transitioned from one status to another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<metav1::Time>,

    pub reason: String,

    pub message: String,
}

impl Condition {
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            last_transition_time: None,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Compares two conditions ignoring their transition times, so that an
    /// unchanged status round-trip does not trigger a write.
    pub fn equivalent(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

impl Status {
    pub fn find_condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|cond| cond.type_ == type_)
    }

    pub fn is_condition_true(&self, type_: ConditionType) -> bool {
        self.find_condition(type_)
            .is_some_and(|cond| cond.status == ConditionStatus::True)
    }

    /// Inserts or updates the condition of the given type. The transition
    /// time only advances when the status itself changes; reason and message
    /// updates leave it untouched.
    pub fn set_condition(&mut self, new_condition: Condition) {
        let now = metav1::Time(k8s_openapi::chrono::Utc::now());

        match self
            .conditions
            .iter_mut()
            .find(|cond| cond.type_ == new_condition.type_)
        {
            None => {
                let mut new_condition = new_condition;
                if new_condition.last_transition_time.is_none() {
                    new_condition.last_transition_time = Some(now);
                }
                self.conditions.push(new_condition);
            }
            Some(existing) => {
                if existing.status != new_condition.status {
                    existing.status = new_condition.status;
                    existing.last_transition_time =
                        new_condition.last_transition_time.or(Some(now));
                }
                existing.reason = new_condition.reason;
                existing.message = new_condition.message;
            }
        }
    }
}
