//! Dependency resolution
//!
//! Computes the build order with Tarjan's strongly connected components
//! algorithm. Components come out in reverse topological order, so the
//! flattened result lists every package after its dependencies; a
//! component with more than one member is a dependency loop.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::core::find::{check_package_groups, Locator};
use crate::core::package::PackageDescriptor;
use crate::core::pm::{Gate, PackageManager};
use crate::error::ResolverError;

/// How a resolution run treats loops and installed dependencies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Turn installable dependencies that are also queued back into edges
    pub reorder: bool,
    /// Only the order is wanted; loops are reported but tolerated in reorder mode
    pub save_list: bool,
}

/// Adjacency view keyed by package name, first occurrence keeps its position
pub fn get_deps_graph(packages: Vec<PackageDescriptor>) -> IndexMap<String, PackageDescriptor> {
    let mut graph = IndexMap::with_capacity(packages.len());
    for package in packages {
        graph.insert(package.name.clone(), package);
    }
    graph
}

/// Move members of each group next to the first one, in sequence order
pub fn hoist_group_members(packages: Vec<PackageDescriptor>) -> Vec<PackageDescriptor> {
    let mut members: HashMap<String, Vec<PackageDescriptor>> = HashMap::new();
    let mut order: Vec<Result<PackageDescriptor, String>> = Vec::with_capacity(packages.len());
    for package in packages {
        match package.group_slug.clone() {
            Some(slug) => {
                let group = members.entry(slug.clone()).or_default();
                if group.is_empty() {
                    order.push(Err(slug));
                }
                group.push(package);
            }
            None => order.push(Ok(package)),
        }
    }

    let mut hoisted = Vec::new();
    for entry in order {
        match entry {
            Ok(package) => hoisted.push(package),
            Err(slug) => {
                let mut group = members.remove(&slug).unwrap_or_default();
                group.sort_by_key(|p| p.group_sequence);
                hoisted.extend(group);
            }
        }
    }
    hoisted
}

/// Move installables that are also queued for building into `deps`
pub fn prepare_for_reorder(package: &mut PackageDescriptor, queued: &HashSet<String>) {
    let installables = std::mem::take(&mut package.installables);
    for dep in installables {
        if dep != package.name && queued.contains(&dep) {
            if !package.deps.contains(&dep) {
                package.deps.push(dep);
            }
        } else {
            package.installables.push(dep);
        }
    }
}

/// Whether a component is a dependency loop
pub fn is_loop(component: &[PackageDescriptor]) -> bool {
    match component {
        [single] => single.deps.contains(&single.name),
        _ => component.len() > 1,
    }
}

#[derive(Default)]
struct TarjanState {
    counter: usize,
    index: HashMap<String, usize>,
    lowlink: HashMap<String, usize>,
    on_stack: HashSet<String>,
    stack: Vec<String>,
    /// Grows when a group member pulls in its siblings
    roots: Vec<String>,
    skipped: HashSet<String>,
    results: Vec<Vec<String>>,
}

/// Resolves build order for one request
///
/// Owns the pool of every recipe seen so far; dependencies missing from
/// the pool are looked up through the [`Locator`] on first use.
pub struct Resolver<'a, P> {
    locator: &'a Locator,
    gate: &'a Gate<P>,
    pool: IndexMap<String, PackageDescriptor>,
}

impl<'a, P: PackageManager> Resolver<'a, P> {
    pub fn new(locator: &'a Locator, gate: &'a Gate<P>) -> Self {
        Self {
            locator,
            gate,
            pool: IndexMap::new(),
        }
    }

    pub fn pool(&self) -> &IndexMap<String, PackageDescriptor> {
        &self.pool
    }

    fn arch(&self) -> &str {
        &self.locator.context().arch
    }

    /// Drop requested packages that cannot be built on this architecture
    pub fn filter_unbuildable(&self, packages: Vec<PackageDescriptor>) -> Vec<PackageDescriptor> {
        let (buildable, unbuildable): (Vec<_>, Vec<_>) = packages
            .into_iter()
            .partition(|p| p.is_buildable_on(self.arch()));
        if !unbuildable.is_empty() {
            let names: Vec<&str> = unbuildable.iter().map(|p| p.name.as_str()).collect();
            warn!(
                "The following packages will be skipped as they are not buildable:\n\t{}",
                names.join(" ")
            );
        }
        buildable
    }

    /// Full resolution: filtering, ordering, loop and group checks
    pub fn resolve(
        &mut self,
        packages: Vec<PackageDescriptor>,
        options: ResolveOptions,
    ) -> Result<Vec<PackageDescriptor>, ResolverError> {
        let packages = hoist_group_members(self.filter_unbuildable(packages));
        debug!("Converting queue into adjacency graph...");
        let graph = get_deps_graph(packages);
        debug!("Running Tarjan search...");
        let mut resolved = self.tarjan_search(graph)?;

        if options.reorder {
            info!("Re-ordering packages...");
            let flat: Vec<PackageDescriptor> = resolved.into_iter().flatten().collect();
            let queued: HashSet<String> = flat.iter().map(|p| p.name.clone()).collect();
            let reordered = flat
                .into_iter()
                .map(|mut p| {
                    prepare_for_reorder(&mut p, &queued);
                    p
                })
                .collect();
            resolved = self.tarjan_search(get_deps_graph(reordered))?;
        }

        let mut cycles = Vec::new();
        let mut order = Vec::new();
        for component in resolved {
            if is_loop(&component) {
                let names: Vec<String> = component.iter().map(|p| p.name.clone()).collect();
                warn!("Found a loop in the dependency graph: {}", names.join(", "));
                cycles.push(names);
            }
            order.extend(component);
        }

        if !cycles.is_empty() {
            if options.reorder && options.save_list {
                info!("The queue will still be saved, but the build order inside the loop is not guaranteed");
            } else {
                if options.reorder {
                    warn!("You probably want to add -p to get a list of ordered packages");
                }
                return Err(ResolverError::CircularDependency { cycles });
            }
        }

        if !options.reorder {
            check_package_groups(&order)?;
        }
        Ok(order)
    }

    /// Strongly connected components of `graph`, dependencies first
    pub fn tarjan_search(
        &mut self,
        graph: IndexMap<String, PackageDescriptor>,
    ) -> Result<Vec<Vec<PackageDescriptor>>, ResolverError> {
        let mut state = TarjanState {
            roots: graph.keys().cloned().collect(),
            ..TarjanState::default()
        };
        self.pool.extend(graph);

        let mut i = 0;
        while i < state.roots.len() {
            let root = state.roots[i].clone();
            if !state.index.contains_key(&root) && !state.skipped.contains(&root) {
                self.strongly_connected(&root, None, &mut state)?;
            }
            i += 1;
        }

        Ok(state
            .results
            .into_iter()
            .map(|component| {
                component
                    .iter()
                    .filter_map(|name| self.pool.get(name).cloned())
                    .collect()
            })
            .collect())
    }

    /// Make sure `name` is in the pool, looking it up in the tree if needed
    fn load(&mut self, name: &str, state: &mut TarjanState) -> Result<(), ResolverError> {
        if self.pool.contains_key(name) {
            return Ok(());
        }
        let found = self.locator.find_package(name)?;
        if !found.iter().any(|p| p.name == name) {
            return Err(ResolverError::NotFound {
                name: name.to_string(),
            });
        }
        for package in found {
            if package.name != name && !self.pool.contains_key(&package.name) {
                state.roots.push(package.name.clone());
            }
            self.pool.entry(package.name.clone()).or_insert(package);
        }
        Ok(())
    }

    fn strongly_connected(
        &mut self,
        vert: &str,
        required_by: Option<&str>,
        state: &mut TarjanState,
    ) -> Result<(), ResolverError> {
        self.load(vert, state)?;
        let arch = self.arch().to_string();
        let package = self
            .pool
            .get_mut(vert)
            .ok_or_else(|| ResolverError::NotFound {
                name: vert.to_string(),
            })?;

        if !package.is_buildable_on(&arch) {
            return match required_by {
                Some(parent) => Err(ResolverError::Unbuildable {
                    package: vert.to_string(),
                    required_by: parent.to_string(),
                    arch,
                }),
                None => {
                    warn!("Skipping {vert}: not buildable on {arch}");
                    state.skipped.insert(vert.to_string());
                    Ok(())
                }
            };
        }
        self.gate.filter_dependencies(package)?;
        let deps = package.deps.clone();

        let own_index = state.counter;
        state.counter += 1;
        state.index.insert(vert.to_string(), own_index);
        state.lowlink.insert(vert.to_string(), own_index);
        state.stack.push(vert.to_string());
        state.on_stack.insert(vert.to_string());
        debug!("[{}/{}] {vert}", state.results.len() + 1, self.pool.len());

        for dep in &deps {
            if state.skipped.contains(dep) {
                return Err(ResolverError::Unbuildable {
                    package: dep.clone(),
                    required_by: vert.to_string(),
                    arch,
                });
            }
            if let Some(&dep_index) = state.index.get(dep) {
                if state.on_stack.contains(dep) {
                    lower(state, vert, dep_index);
                }
            } else {
                self.strongly_connected(dep, Some(vert), state)?;
                let dep_low = state.lowlink.get(dep).copied().unwrap_or(usize::MAX);
                lower(state, vert, dep_low);
            }
        }

        if state.lowlink.get(vert) == Some(&own_index) {
            let mut component = Vec::new();
            while let Some(member) = state.stack.pop() {
                state.on_stack.remove(&member);
                let done = member == vert;
                component.push(member);
                if done {
                    break;
                }
            }
            state.results.push(component);
        }
        Ok(())
    }
}

fn lower(state: &mut TarjanState, vert: &str, value: usize) {
    if let Some(low) = state.lowlink.get_mut(vert) {
        *low = (*low).min(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::ParseContext;
    use crate::core::pm::fake::FakePackageManager;
    use crate::core::package::ArchPattern;
    use proptest::prelude::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn package(name: &str, deps: &[&str]) -> PackageDescriptor {
        let mut p = PackageDescriptor::new(name, "1", PathBuf::from(name));
        p.deps = deps.iter().map(|d| (*d).to_string()).collect();
        p
    }

    fn member(name: &str, seq: u32, deps: &[&str]) -> PackageDescriptor {
        let mut p = package(name, deps);
        p.group_slug = Some("lib/suite".to_string());
        p.group_sequence = seq;
        p
    }

    struct Fixture {
        _tree: TempDir,
        locator: Locator,
        gate: Gate<FakePackageManager>,
    }

    impl Fixture {
        fn new(installed: &[&str], reorder: bool) -> Self {
            let tree = TempDir::new().unwrap();
            let locator = Locator::new(
                tree.path().to_path_buf(),
                ParseContext::new("amd64"),
                tree.path().join(".build"),
            );
            Self {
                _tree: tree,
                locator,
                gate: Gate::new(FakePackageManager::with(installed, &[]), reorder),
            }
        }

        fn write(&self, name: &str, deps: &str) {
            let dir = self.locator.tree().join("base").join(name);
            std::fs::create_dir_all(dir.join("autobuild")).unwrap();
            std::fs::write(dir.join("spec"), "VER=1\nDUMMYSRC=1\n").unwrap();
            std::fs::write(
                dir.join("autobuild/defines"),
                format!("PKGNAME={name}\nPKGDEP=\"{deps}\"\n"),
            )
            .unwrap();
        }

        fn resolver(&self) -> Resolver<'_, FakePackageManager> {
            Resolver::new(&self.locator, &self.gate)
        }
    }

    fn names(packages: &[PackageDescriptor]) -> Vec<&str> {
        packages.iter().map(|p| p.name.as_str()).collect()
    }

    fn position(order: &[PackageDescriptor], name: &str) -> usize {
        order.iter().position(|p| p.name == name).unwrap()
    }

    // ============================================
    // Unit Tests
    // ============================================

    #[test]
    fn test_simple_dependency_order() {
        let f = Fixture::new(&[], false);
        let order = f
            .resolver()
            .resolve(vec![package("app", &["lib"]), package("lib", &[])], ResolveOptions::default())
            .unwrap();
        assert_eq!(names(&order), vec!["lib", "app"]);
    }

    #[test]
    fn test_two_package_cycle() {
        let f = Fixture::new(&[], false);
        let err = f
            .resolver()
            .resolve(vec![package("A", &["B"]), package("B", &["A"])], ResolveOptions::default())
            .unwrap_err();
        match err {
            ResolverError::CircularDependency { cycles } => {
                assert_eq!(cycles.len(), 1);
                let mut cycle = cycles[0].clone();
                cycle.sort();
                assert_eq!(cycle, vec!["A", "B"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_tarjan_components() {
        let f = Fixture::new(&[], false);
        let graph = get_deps_graph(vec![
            package("a", &["b"]),
            package("b", &["c"]),
            package("c", &["a"]),
            package("d", &["c"]),
        ]);
        let components = f.resolver().tarjan_search(graph).unwrap();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].len(), 3);
        assert_eq!(names(&components[1]), vec!["d"]);
    }

    #[test]
    fn test_order_is_deterministic() {
        let input = || {
            vec![
                package("x", &["z"]),
                package("y", &["z"]),
                package("z", &[]),
                package("w", &["x", "y"]),
            ]
        };
        let f = Fixture::new(&[], false);
        let first = f.resolver().resolve(input(), ResolveOptions::default()).unwrap();
        let second = f.resolver().resolve(input(), ResolveOptions::default()).unwrap();
        assert_eq!(names(&first), names(&second));
        assert_eq!(names(&first), vec!["z", "x", "y", "w"]);
    }

    #[test]
    fn test_installed_dependencies_are_not_edges() {
        let f = Fixture::new(&["glibc"], false);
        let order = f
            .resolver()
            .resolve(vec![package("app", &["glibc"])], ResolveOptions::default())
            .unwrap();
        assert_eq!(names(&order), vec!["app"]);
        assert!(order[0].deps.is_empty());
    }

    #[test]
    fn test_missing_dependency_is_loaded_from_tree() {
        let f = Fixture::new(&[], false);
        f.write("libfoo", "libbar");
        f.write("libbar", "");
        let order = f
            .resolver()
            .resolve(vec![package("app", &["libfoo"])], ResolveOptions::default())
            .unwrap();
        assert_eq!(names(&order), vec!["libbar", "libfoo", "app"]);
    }

    #[test]
    fn test_missing_dependency_not_in_tree() {
        let f = Fixture::new(&[], false);
        let err = f
            .resolver()
            .resolve(vec![package("app", &["ghost"])], ResolveOptions::default())
            .unwrap_err();
        assert!(matches!(err, ResolverError::NotFound { ref name } if name == "ghost"));
    }

    #[test]
    fn test_unbuildable_request_is_skipped() {
        let f = Fixture::new(&[], false);
        let mut p = package("firmware", &[]);
        p.fail_arch = Some(ArchPattern::compile("amd64").unwrap());
        let order = f
            .resolver()
            .resolve(vec![p, package("app", &[])], ResolveOptions::default())
            .unwrap();
        assert_eq!(names(&order), vec!["app"]);
    }

    #[test]
    fn test_unbuildable_dependency_names_requirer() {
        let f = Fixture::new(&[], false);
        f.write("firmware", "");
        std::fs::write(
            f.locator.tree().join("base/firmware/autobuild/defines"),
            "PKGNAME=firmware\nFAIL_ARCH=\"!arm64\"\n",
        )
        .unwrap();
        let err = f
            .resolver()
            .resolve(vec![package("app", &["firmware"])], ResolveOptions::default())
            .unwrap_err();
        match err {
            ResolverError::Unbuildable {
                package,
                required_by,
                ..
            } => {
                assert_eq!(package, "firmware");
                assert_eq!(required_by, "app");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_group_order_is_restored() {
        let f = Fixture::new(&[], false);
        let order = f
            .resolver()
            .resolve(
                vec![
                    member("suite-c", 3, &[]),
                    package("app", &["suite-a"]),
                    member("suite-a", 1, &[]),
                    member("suite-b", 2, &[]),
                ],
                ResolveOptions::default(),
            )
            .unwrap();
        assert_eq!(names(&order), vec!["suite-a", "suite-b", "suite-c", "app"]);
    }

    #[test]
    fn test_group_order_violation_names_both_members() {
        let f = Fixture::new(&[], false);
        let err = f
            .resolver()
            .resolve(
                vec![member("suite-a", 1, &["suite-b"]), member("suite-b", 2, &[])],
                ResolveOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ResolverError::GroupOrder { .. }));
        let msg = err.to_string();
        assert!(msg.contains("suite-a"));
        assert!(msg.contains("suite-b"));
    }

    #[test]
    fn test_reorder_turns_queued_installables_into_edges() {
        let f = Fixture::new(&["lib"], true);
        let order = f
            .resolver()
            .resolve(vec![package("app", &["lib"]), package("lib", &[])], ResolveOptions {
                reorder: true,
                save_list: false,
            })
            .unwrap();
        assert_eq!(names(&order), vec!["lib", "app"]);
        assert_eq!(order[1].deps, vec!["lib"]);
    }

    #[test]
    fn test_reorder_loop_tolerated_only_when_saving() {
        let f = Fixture::new(&["a", "b"], true);
        let input = || vec![package("a", &["b"]), package("b", &["a"])];
        let err = f
            .resolver()
            .resolve(input(), ResolveOptions {
                reorder: true,
                save_list: false,
            })
            .unwrap_err();
        assert!(matches!(err, ResolverError::CircularDependency { .. }));

        let order = f
            .resolver()
            .resolve(input(), ResolveOptions {
                reorder: true,
                save_list: true,
            })
            .unwrap();
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn test_hoist_group_members() {
        let hoisted = hoist_group_members(vec![
            package("x", &[]),
            member("suite-b", 2, &[]),
            package("y", &[]),
            member("suite-a", 1, &[]),
        ]);
        assert_eq!(names(&hoisted), vec!["x", "suite-a", "suite-b", "y"]);
    }

    #[test]
    fn test_prepare_for_reorder() {
        let mut p = package("app", &[]);
        p.installables = vec!["app".to_string(), "lib".to_string(), "zlib".to_string()];
        let queued: HashSet<String> = ["app", "lib"].iter().map(|s| (*s).to_string()).collect();
        prepare_for_reorder(&mut p, &queued);
        assert_eq!(p.deps, vec!["lib"]);
        assert_eq!(p.installables, vec!["app", "zlib"]);
    }

    // ============================================
    // Property Tests
    // ============================================

    /// Acyclic graphs: package `i` only depends on packages with a smaller index
    fn acyclic_packages() -> impl Strategy<Value = Vec<PackageDescriptor>> {
        (1usize..20)
            .prop_flat_map(|n| {
                proptest::collection::vec(proptest::collection::vec(any::<prop::sample::Index>(), 0..4), n)
            })
            .prop_flat_map(|edges| {
                let packages: Vec<PackageDescriptor> = edges
                    .iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        let mut deps: Vec<String> = if i == 0 {
                            Vec::new()
                        } else {
                            picks.iter().map(|ix| format!("p{}", ix.index(i))).collect()
                        };
                        deps.dedup();
                        let mut p = PackageDescriptor::new(format!("p{i}"), "1", PathBuf::from("x"));
                        p.deps = deps;
                        p
                    })
                    .collect();
                Just(packages).prop_shuffle()
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(crate::config::defaults::MIN_PROPTEST_ITERATIONS))]

        #[test]
        fn prop_every_package_follows_its_dependencies(packages in acyclic_packages()) {
            let f = Fixture::new(&[], false);
            let expected = packages.len();
            let order = f.resolver().resolve(packages, ResolveOptions::default()).unwrap();
            prop_assert_eq!(order.len(), expected);
            for p in &order {
                for dep in &p.deps {
                    prop_assert!(position(&order, dep) < position(&order, &p.name));
                }
            }
        }
    }
}
