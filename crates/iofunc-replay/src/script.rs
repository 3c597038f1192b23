// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Replay scripts: a namespace to seed and a sequence of client messages

use std::sync::Arc;

use anyhow::{Context, Result};
use iofunc_core::{
    AbilityTable, ClientInfo, DefaultHandler, MemDriver, Mount, MountConfig, QueueTransport, RcvId,
    Request, ResourceManager, Response,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub grants: Vec<Grant>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct NodeSpec {
    pub path: String,
    /// Full mode including the file type bits
    pub mode: u32,
    pub owner: ClientInfo,
}

#[derive(Debug, Deserialize)]
pub struct Grant {
    pub pid: u32,
    pub ability: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Send {
        client: ClientInfo,
        coid: u32,
        /// Defaults to the step's position in the script
        #[serde(default)]
        rcvid: Option<u64>,
        request: Request,
    },
    Disconnect {
        client: ClientInfo,
    },
    Unlink {
        path: String,
    },
}

/// One line of replay output
#[derive(Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Reply { step: usize, rcvid: u64, response: Response },
    DeferredReply { step: usize, rcvid: u64, response: Response },
    Event { step: usize, pid: u32, coid: u32, event: u64, conds: u32 },
    Note { step: usize, message: String },
}

impl Record {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .unwrap_or_else(|err| json!({ "kind": "note", "message": err.to_string() }))
    }
}

impl Script {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("parsing replay script")
    }
}

/// Run `script` against a fresh resource manager over a memory driver.
pub fn replay(config: MountConfig, script: &Script) -> Result<Vec<Record>> {
    let abilities = Arc::new(iofunc_core::StaticAbilities::new());
    for grant in &script.grants {
        abilities.grant(grant.pid, &grant.ability);
    }
    let table = AbilityTable::init(Box::new(Arc::clone(&abilities)))
        .context("initializing abilities")?;
    let transport = Arc::new(QueueTransport::new());
    let rm = ResourceManager::new(
        Mount::new(config),
        Arc::new(table),
        Box::new(DefaultHandler::new(MemDriver::new())),
        transport.clone(),
    );

    for node in &script.nodes {
        rm.create_node(&node.path, node.mode, &node.owner)
            .with_context(|| format!("creating node {}", node.path))?;
    }

    let mut records = Vec::new();
    for (index, step) in script.steps.iter().enumerate() {
        let step_no = index + 1;
        match step {
            Step::Send {
                client,
                coid,
                rcvid,
                request,
            } => {
                let rcvid = rcvid.unwrap_or(step_no as u64);
                tracing::debug!(step = step_no, op = request.name(), rcvid, "replaying");
                let ctx = rm.context(RcvId(rcvid), *coid, client.clone());
                if let Some(response) = rm.dispatch(&ctx, request.clone()) {
                    records.push(Record::Reply {
                        step: step_no,
                        rcvid,
                        response,
                    });
                }
            }
            Step::Disconnect { client } => {
                rm.disconnect(client);
                records.push(Record::Note {
                    step: step_no,
                    message: format!("pid {} disconnected", client.pid),
                });
            }
            Step::Unlink { path } => {
                let message = match rm.unlink(path) {
                    Ok(()) => format!("{path} unlinked"),
                    Err(err) => format!("unlink {path}: {err}"),
                };
                records.push(Record::Note { step: step_no, message });
            }
        }

        for (rcvid, response) in transport.take_replies() {
            records.push(Record::DeferredReply {
                step: step_no,
                rcvid: rcvid.0,
                response,
            });
        }
        for event in transport.take_events() {
            records.push(Record::Event {
                step: step_no,
                pid: event.key.pid,
                coid: event.key.coid,
                event: event.event,
                conds: event.cond.bits(),
            });
        }
    }
    Ok(records)
}
