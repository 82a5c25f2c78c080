//! 模块依赖图
//!
//! 边从模块指向它声明的每个依赖。图在已注册模块集合变化时整体重建，
//! 节点深度只用于诊断，加载顺序由注册表的深度优先解析决定。
//!
//! 环检测使用显式栈的迭代 DFS，不依赖调用栈深度。
//!
//! # 示例
//!
//! ```rust
//! use module_runtime::module::dependency::DependencyGraph;
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_dependency("chat", "transport");
//! graph.add_dependency("queue", "transport");
//!
//! assert_eq!(graph.get_dependents("transport"), vec!["chat", "queue"]);
//! assert!(graph.find_cycle().is_none());
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::Serialize;

use crate::module::metadata::ModuleMetadata;
use crate::utils::{CoreError, Result};

/// 依赖图节点（诊断用快照）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyNode {
    /// 模块 ID
    pub module_id: String,
    /// 直接依赖
    pub dependencies: BTreeSet<String>,
    /// 直接依赖者
    pub dependents: BTreeSet<String>,
    /// 深度：无依赖为 0，否则为 1 + 依赖的最大深度
    pub depth: usize,
}

/// 模块依赖关系图
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 正向边：模块 ID -> 该模块依赖的模块
    edges: BTreeMap<String, BTreeSet<String>>,
    /// 反向边：模块 ID -> 依赖该模块的模块
    reverse_edges: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl DependencyGraph {
    /// 创建空图
    pub fn new() -> Self {
        Self::default()
    }

    /// 由一组已注册模块的元数据构建依赖图
    ///
    /// 只为目标同样在集合内的依赖建边，未注册的可选依赖被忽略。
    pub fn from_modules<'a>(modules: impl IntoIterator<Item = &'a ModuleMetadata>) -> Self {
        let modules: Vec<&ModuleMetadata> = modules.into_iter().collect();
        let ids: BTreeSet<&str> = modules.iter().map(|m| m.id.as_str()).collect();

        let mut graph = Self::new();
        for metadata in &modules {
            graph.add_module(&metadata.id);
            for dep in &metadata.dependencies {
                if ids.contains(dep.module_id.as_str()) {
                    graph.add_dependency(&metadata.id, &dep.module_id);
                }
            }
        }
        graph
    }

    /// 添加模块节点，已存在时不做任何事
    pub fn add_module(&mut self, module_id: &str) {
        self.edges.entry(module_id.to_string()).or_default();
        self.reverse_edges.entry(module_id.to_string()).or_default();
    }

    /// 添加依赖关系：`module_id` 依赖 `dependency_id`
    pub fn add_dependency(&mut self, module_id: &str, dependency_id: &str) {
        self.add_module(module_id);
        self.add_module(dependency_id);
        self.edges
            .entry(module_id.to_string())
            .or_default()
            .insert(dependency_id.to_string());
        self.reverse_edges
            .entry(dependency_id.to_string())
            .or_default()
            .insert(module_id.to_string());
    }

    /// 移除模块及其所有边
    pub fn remove_module(&mut self, module_id: &str) {
        for dep in self.edges.remove(module_id).unwrap_or_default() {
            if let Some(rev) = self.reverse_edges.get_mut(&dep) {
                rev.remove(module_id);
            }
        }
        for dependent in self.reverse_edges.remove(module_id).unwrap_or_default() {
            if let Some(deps) = self.edges.get_mut(&dependent) {
                deps.remove(module_id);
            }
        }
    }

    /// 直接依赖（按 ID 排序）
    pub fn get_dependencies(&self, module_id: &str) -> Vec<String> {
        self.edges
            .get(module_id)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 直接依赖者（按 ID 排序）
    pub fn get_dependents(&self, module_id: &str) -> Vec<String> {
        self.reverse_edges
            .get(module_id)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 是否包含模块
    pub fn contains_module(&self, module_id: &str) -> bool {
        self.edges.contains_key(module_id)
    }

    /// 节点数量
    pub fn module_count(&self) -> usize {
        self.edges.len()
    }

    /// 查找一个环
    ///
    /// # 返回
    ///
    /// 环上的模块路径，首尾为同一个模块，例如 `["a", "b", "a"]`
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for start in self.edges.keys() {
            if marks.contains_key(start.as_str()) {
                continue;
            }

            // 栈元素：(节点, 下一个待访问的依赖下标)；栈本身即当前路径
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), Mark::InProgress);

            while let Some(&(node, next)) = stack.last() {
                let next_dep = self.edges.get(node).and_then(|deps| deps.iter().nth(next));
                let Some(dep) = next_dep else {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                };
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                match marks.get(dep.as_str()) {
                    Some(Mark::InProgress) => {
                        let begin = stack.iter().position(|(n, _)| *n == dep.as_str()).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[begin..].iter().map(|(n, _)| n.to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(dep.as_str(), Mark::InProgress);
                        stack.push((dep.as_str(), 0));
                    }
                }
            }
        }

        None
    }

    /// 图必须无环
    ///
    /// # 错误
    ///
    /// 存在环时返回 `CoreError::CircularDependency`，消息中包含环路径
    pub fn ensure_acyclic(&self) -> Result<()> {
        match self.find_cycle() {
            Some(cycle) => Err(CoreError::CircularDependency(cycle.join(" -> "))),
            None => Ok(()),
        }
    }

    /// 拓扑排序（Kahn 算法），依赖排在依赖者之前
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut remaining: BTreeMap<&str, usize> = self
            .edges
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();

        let mut queue: VecDeque<&str> = remaining
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(self.edges.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for dependent in self.reverse_edges.get(id).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }

        if order.len() != self.edges.len() {
            self.ensure_acyclic()?;
            return Err(CoreError::Internal("无法完成拓扑排序".to_string()));
        }
        Ok(order)
    }

    /// 计算所有节点及其深度
    pub fn nodes(&self) -> Result<Vec<DependencyNode>> {
        let mut depths: HashMap<String, usize> = HashMap::new();
        for id in self.topological_order()? {
            let depth = self.edges[&id]
                .iter()
                .filter_map(|dep| depths.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depths.insert(id, depth);
        }

        Ok(self
            .edges
            .iter()
            .map(|(id, deps)| DependencyNode {
                module_id: id.clone(),
                dependencies: deps.clone(),
                dependents: self.reverse_edges.get(id).cloned().unwrap_or_default(),
                depth: depths.get(id).copied().unwrap_or(0),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::metadata::ModuleDependency;

    #[test]
    fn test_add_and_query() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("a", "b");
        graph.add_dependency("a", "c");
        graph.add_dependency("d", "b");

        assert_eq!(graph.get_dependencies("a"), vec!["b", "c"]);
        assert_eq!(graph.get_dependents("b"), vec!["a", "d"]);
        assert_eq!(graph.module_count(), 4);
        assert!(graph.get_dependencies("missing").is_empty());
    }

    #[test]
    fn test_remove_module() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("a", "b");
        graph.add_dependency("b", "c");

        graph.remove_module("b");

        assert!(!graph.contains_module("b"));
        assert!(graph.get_dependencies("a").is_empty());
        assert!(graph.get_dependents("c").is_empty());
    }

    #[test]
    fn test_find_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("a", "b");
        graph.add_dependency("b", "c");
        assert!(graph.find_cycle().is_none());
        assert!(graph.ensure_acyclic().is_ok());

        graph.add_dependency("c", "a");
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);

        let err = graph.ensure_acyclic().unwrap_err();
        assert!(matches!(err, CoreError::CircularDependency(_)));
    }

    #[test]
    fn test_two_node_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("a", "b");
        graph.add_dependency("b", "a");
        assert_eq!(graph.find_cycle().unwrap(), vec!["a", "b", "a"]);
        assert!(graph.topological_order().is_err());
        assert!(graph.nodes().is_err());
    }

    #[test]
    fn test_long_chain_does_not_overflow() {
        let mut graph = DependencyGraph::new();
        for i in 0..50_000 {
            graph.add_dependency(&format!("m{}", i), &format!("m{}", i + 1));
        }
        assert!(graph.find_cycle().is_none());

        graph.add_dependency("m50000", "m0");
        assert!(graph.find_cycle().is_some());
    }

    #[test]
    fn test_topological_order() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("app", "service");
        graph.add_dependency("service", "database");
        graph.add_dependency("app", "database");

        let order = graph.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("database") < pos("service"));
        assert!(pos("service") < pos("app"));
    }

    #[test]
    fn test_nodes_depth() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("app", "service");
        graph.add_dependency("service", "database");
        graph.add_dependency("app", "database");
        graph.add_module("standalone");

        let nodes = graph.nodes().unwrap();
        let depth = |id: &str| nodes.iter().find(|n| n.module_id == id).unwrap().depth;
        assert_eq!(depth("database"), 0);
        assert_eq!(depth("service"), 1);
        assert_eq!(depth("app"), 2);
        assert_eq!(depth("standalone"), 0);

        let db = nodes.iter().find(|n| n.module_id == "database").unwrap();
        assert!(db.dependents.contains("app") && db.dependents.contains("service"));
    }

    #[test]
    fn test_from_modules_skips_unregistered() {
        let a = ModuleMetadata::new("a", "A", "1.0.0")
            .with_dependency(ModuleDependency::required("b"))
            .with_dependency(ModuleDependency::optional("missing"));
        let b = ModuleMetadata::new("b", "B", "1.0.0");

        let graph = DependencyGraph::from_modules([&a, &b]);
        assert_eq!(graph.get_dependencies("a"), vec!["b"]);
        assert!(!graph.contains_module("missing"));
    }
}
