use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::GraphError;
use crate::model::{TaskDefinition, TaskDependType, WorkflowDefinition};

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub definition: TaskDefinition,
    /// Direct predecessors, restricted to nodes that are part of this graph.
    pub pre_tasks: Vec<i64>,
    pub post_tasks: Vec<i64>,
}

/// DAG over task codes for one workflow definition version. Read-only once built.
#[derive(Debug, Clone)]
pub struct WorkflowExecutionGraph {
    nodes: HashMap<i64, GraphNode>,
    roots: Vec<i64>,
    topological_order: Vec<i64>,
}

impl WorkflowExecutionGraph {
    /// Builds the graph for the whole definition.
    pub fn from_definition(definition: &WorkflowDefinition) -> Result<Self, GraphError> {
        Self::build(definition, &[], TaskDependType::TaskPost)
    }

    /// Builds the graph, optionally narrowed to `start_nodes` and their neighbours as
    /// selected by `depend_type`. Forbidden tasks are removed and their edges bridged.
    pub fn build(
        definition: &WorkflowDefinition,
        start_nodes: &[i64],
        depend_type: TaskDependType,
    ) -> Result<Self, GraphError> {
        // Definition order is used as the tie-break everywhere so builds are deterministic.
        let mut position: HashMap<i64, usize> = HashMap::new();
        for (index, task) in definition.tasks.iter().enumerate() {
            if position.insert(task.code, index).is_some() {
                return Err(GraphError::DuplicateTask(task.code));
            }
        }

        let mut raw_pre: HashMap<i64, Vec<i64>> =
            position.keys().map(|code| (*code, Vec::new())).collect();
        for relation in &definition.relations {
            let pre = relation.pre.unwrap_or(0);
            if !position.contains_key(&relation.post) {
                return Err(GraphError::DanglingReference { pre, post: relation.post });
            }
            let Some(pre) = relation.pre.filter(|code| *code != 0) else {
                continue;
            };
            if !position.contains_key(&pre) {
                return Err(GraphError::DanglingReference { pre, post: relation.post });
            }
            let entry = raw_pre.entry(relation.post).or_default();
            if !entry.contains(&pre) {
                entry.push(pre);
            }
        }

        let full_order = topological_sort(&raw_pre, &position)?;

        let forbidden: HashSet<i64> = definition
            .tasks
            .iter()
            .filter(|t| t.forbidden)
            .map(|t| t.code)
            .collect();

        // Walking in topological order means every predecessor's bridged list is ready.
        let mut bridged_pre: HashMap<i64, Vec<i64>> = HashMap::new();
        for code in &full_order {
            let mut effective = Vec::new();
            for pre in &raw_pre[code] {
                if forbidden.contains(pre) {
                    for inherited in &bridged_pre[pre] {
                        if !effective.contains(inherited) {
                            effective.push(*inherited);
                        }
                    }
                } else if !effective.contains(pre) {
                    effective.push(*pre);
                }
            }
            bridged_pre.insert(*code, effective);
        }
        for code in &forbidden {
            bridged_pre.remove(code);
        }

        let mut bridged_post: HashMap<i64, Vec<i64>> =
            bridged_pre.keys().map(|code| (*code, Vec::new())).collect();
        for code in &full_order {
            if let Some(pres) = bridged_pre.get(code) {
                for pre in pres {
                    if let Some(posts) = bridged_post.get_mut(pre) {
                        posts.push(*code);
                    }
                }
            }
        }

        let retained: HashSet<i64> = if start_nodes.is_empty() {
            bridged_pre.keys().copied().collect()
        } else {
            for code in start_nodes {
                if !position.contains_key(code) {
                    return Err(GraphError::UnknownStartNode(*code));
                }
            }
            let seeds: Vec<i64> = start_nodes
                .iter()
                .copied()
                .filter(|code| !forbidden.contains(code))
                .collect();
            match depend_type {
                TaskDependType::TaskOnly => seeds.into_iter().collect(),
                TaskDependType::TaskPre => reachable(&seeds, &bridged_pre),
                TaskDependType::TaskPost => reachable(&seeds, &bridged_post),
            }
        };

        let mut nodes = HashMap::with_capacity(retained.len());
        for task in &definition.tasks {
            if !retained.contains(&task.code) {
                continue;
            }
            let keep = |codes: &Vec<i64>| -> Vec<i64> {
                codes.iter().copied().filter(|c| retained.contains(c)).collect()
            };
            nodes.insert(
                task.code,
                GraphNode {
                    definition: task.clone(),
                    pre_tasks: keep(&bridged_pre[&task.code]),
                    post_tasks: keep(&bridged_post[&task.code]),
                },
            );
        }

        let topological_order: Vec<i64> = full_order
            .into_iter()
            .filter(|code| nodes.contains_key(code))
            .collect();
        let roots = topological_order
            .iter()
            .copied()
            .filter(|code| nodes[code].pre_tasks.is_empty())
            .collect();

        Ok(Self {
            nodes,
            roots,
            topological_order,
        })
    }

    pub fn contains(&self, code: i64) -> bool {
        self.nodes.contains_key(&code)
    }

    pub fn node(&self, code: i64) -> Option<&GraphNode> {
        self.nodes.get(&code)
    }

    pub fn task_definition(&self, code: i64) -> Option<&TaskDefinition> {
        self.nodes.get(&code).map(|n| &n.definition)
    }

    pub fn pre_tasks(&self, code: i64) -> &[i64] {
        self.nodes
            .get(&code)
            .map(|n| n.pre_tasks.as_slice())
            .unwrap_or(&[])
    }

    pub fn post_tasks(&self, code: i64) -> &[i64] {
        self.nodes
            .get(&code)
            .map(|n| n.post_tasks.as_slice())
            .unwrap_or(&[])
    }

    /// Nodes without predecessors inside this graph.
    pub fn root_nodes(&self) -> &[i64] {
        &self.roots
    }

    pub fn topological_order(&self) -> &[i64] {
        &self.topological_order
    }

    pub fn codes(&self) -> impl Iterator<Item = i64> + '_ {
        self.topological_order.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Kahn's algorithm. Nodes left with unresolved predecessors form (or feed) a cycle.
fn topological_sort(
    pre: &HashMap<i64, Vec<i64>>,
    position: &HashMap<i64, usize>,
) -> Result<Vec<i64>, GraphError> {
    let mut in_degree: HashMap<i64, usize> = pre.iter().map(|(c, p)| (*c, p.len())).collect();
    let mut post: HashMap<i64, Vec<i64>> = HashMap::new();
    for (code, pres) in pre {
        for p in pres {
            post.entry(*p).or_default().push(*code);
        }
    }

    let mut ready: Vec<i64> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(c, _)| *c)
        .collect();
    ready.sort_by_key(|c| position[c]);
    let mut queue: VecDeque<i64> = ready.into();

    let mut order = Vec::with_capacity(pre.len());
    while let Some(code) = queue.pop_front() {
        order.push(code);
        let mut released = Vec::new();
        for next in post.get(&code).map(|v| v.as_slice()).unwrap_or(&[]) {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    released.push(*next);
                }
            }
        }
        released.sort_by_key(|c| position[c]);
        queue.extend(released);
    }

    if order.len() != pre.len() {
        let mut codes: Vec<i64> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(c, _)| c)
            .collect();
        codes.sort_unstable();
        return Err(GraphError::CycleDetected { codes });
    }
    Ok(order)
}

fn reachable(seeds: &[i64], edges: &HashMap<i64, Vec<i64>>) -> HashSet<i64> {
    let mut seen: HashSet<i64> = HashSet::new();
    let mut stack: Vec<i64> = seeds.to_vec();
    while let Some(code) = stack.pop() {
        if !seen.insert(code) {
            continue;
        }
        if let Some(next) = edges.get(&code) {
            stack.extend(next.iter().copied().filter(|c| !seen.contains(c)));
        }
    }
    seen
}
