//! Lazy descriptions of computations, composed applicatively and
//! monadically, that evaluate to `(Output<T>, Analysis)`.
//!
//! A `Term<T>` is immutable and cheap to clone (it is a handle onto a
//! shared, type-erased evaluator): one concrete struct per node variant,
//! each implementing the private `Eval<T>` trait, with `Term<T>` itself
//! an `Arc<dyn Eval<T> + Send + Sync>`. This keeps the closed-world set
//! of node kinds (mirrored in `analysis::NodeKind`) while avoiding an
//! enum whose variants would otherwise need to hold `Term<U>` for
//! unrelated `U`.

use crate::analysis::{ActiveState, Analysis, NodeIdAllocator, NodeKind, NodeState, ReadyState};
use crate::input::{Input, InputId};
use crate::output::{Active, Msg, Output};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

/// Type-erased handle onto an `Input<T>` that lets the engine subscribe
/// to its change notifications without knowing `T`. Every `Primitive`
/// and `BindInput` read registers one of these alongside its `InputId`,
/// so a `Term<()>`'s evaluation can hand the engine "wake me when any of
/// these change" regardless of the payload types mixed into the tree.
pub trait AnySubscribe: Send + Sync {
    /// This input's stable identity, so a caller that holds onto
    /// subscriptions across more than one evaluation pass (the engine's
    /// tick loop) can tell "still the same input as last tick" from
    /// "a new dependency appeared" without caring about its payload type.
    fn input_id(&self) -> InputId;

    /// Subscribe `notify` to this input's change notifications. The
    /// returned closure unsubscribes; a caller that only wants a single
    /// wake-up calls it once that has fired, but nothing requires that —
    /// the engine's tick loop keeps a subscription open across many
    /// ticks for as long as the input remains a dependency.
    fn subscribe_refresh(&self, notify: Arc<dyn Fn() + Send + Sync>) -> Box<dyn FnOnce() + Send>;
}

impl<T: Clone + Send + Sync + 'static> AnySubscribe for Input<T> {
    fn input_id(&self) -> InputId {
        self.id()
    }

    fn subscribe_refresh(&self, notify: Arc<dyn Fn() + Send + Sync>) -> Box<dyn FnOnce() + Send> {
        let sub = self.subscribe(move || notify());
        Box::new(move || sub.unsubscribe())
    }
}

/// Per-evaluation bookkeeping: the node-id allocator, the set of inputs
/// this pass read from, type-erased handles onto those same inputs for
/// the engine to subscribe to, and a cache of already-evaluated term
/// nodes keyed by the node's own identity. Reset fresh at the start of
/// every `Term::eval` call.
///
/// The node cache is what gives sub-terms shared by value-identity
/// (the same `Arc<dyn Eval<T>>`, reached twice via `.clone()`) a single
/// shared node in the resulting `Analysis` rather than a duplicated
/// subtree: the first visit allocates and evaluates as usual and the
/// cache remembers the result under the node's address; every later
/// visit within the same pass returns that cached `(Output, Analysis)`
/// instead of re-running `Eval::eval` or allocating a second `NodeId`.
pub struct Env {
    alloc: NodeIdAllocator,
    depends_on: HashSet<InputId>,
    subs: Vec<Arc<dyn AnySubscribe>>,
    node_cache: HashMap<usize, Box<dyn Any + Send + Sync>>,
}

impl Env {
    fn new() -> Self {
        Env {
            alloc: NodeIdAllocator::default(),
            depends_on: HashSet::new(),
            subs: Vec::new(),
            node_cache: HashMap::new(),
        }
    }

    pub fn alloc(&mut self) -> &mut NodeIdAllocator {
        &mut self.alloc
    }

    pub fn register_dependency(&mut self, id: InputId) {
        self.depends_on.insert(id);
    }

    pub fn register_subscribable(&mut self, handle: Arc<dyn AnySubscribe>) {
        self.subs.push(handle);
    }

    /// Evaluate `term`, or return the cached result if this exact node
    /// (by pointer identity, not structural equality) was already
    /// evaluated earlier in this pass. A fat pointer to a `dyn Eval<T>`
    /// is narrowed to its data address, which is stable and unique per
    /// underlying allocation regardless of `T`'s vtable.
    fn cached_eval<T>(&mut self, term: &Term<T>) -> (Output<T>, Analysis)
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = Arc::as_ptr(&term.0) as *const () as usize;
        if let Some(cached) = self.node_cache.get(&key) {
            if let Some((out, analysis)) = cached.downcast_ref::<(Output<T>, Analysis)>() {
                return (out.clone(), analysis.clone());
            }
        }
        let (out, analysis) = term.0.eval(self);
        self.node_cache.insert(key, Box::new((out.clone(), analysis.clone())));
        (out, analysis)
    }
}

trait Eval<T> {
    fn eval(&self, env: &mut Env) -> (Output<T>, Analysis);
}

/// A description of a computation yielding a value of type `T`. Not a
/// value itself — evaluating the same `Term` twice against different
/// input states can yield different results.
pub struct Term<T>(Arc<dyn Eval<T> + Send + Sync>);

impl<T> Clone for Term<T> {
    fn clone(&self) -> Self {
        Term(self.0.clone())
    }
}

fn state_of<T>(output: &Output<T>) -> NodeState {
    match output {
        Output::Ok(_) => NodeState::Ready(ReadyState::Ok),
        Output::Error(_) => NodeState::Ready(ReadyState::Err),
        Output::Active(Active::Running(_)) => NodeState::Active(ActiveState::Running),
        Output::Active(Active::ReadyToRerun(_)) => NodeState::Active(ActiveState::ReadyToRerun),
    }
}

/// Combine several independent statuses the way `Pair`/`All`/`ListMap`
/// do: the first `Error` wins, otherwise any `Active` wins, otherwise
/// everything was `Ok`.
enum Aggregate {
    AllOk,
    Active(Active),
    Error(Msg),
}

fn aggregate<'a, T: 'a>(outputs: impl IntoIterator<Item = &'a Output<T>>) -> Aggregate {
    let mut active: Option<Active> = None;
    for o in outputs {
        match o {
            Output::Error(m) => return Aggregate::Error(m.clone()),
            Output::Active(a) if active.is_none() => active = Some(a.clone()),
            _ => {}
        }
    }
    match active {
        Some(a) => Aggregate::Active(a),
        None => Aggregate::AllOk,
    }
}

// ---- Return ----

struct ReturnNode<T> {
    value: T,
    label: Option<String>,
}

impl<T: Clone> Eval<T> for ReturnNode<T> {
    fn eval(&self, env: &mut Env) -> (Output<T>, Analysis) {
        let label = self.label.clone().unwrap_or_else(|| "constant".to_string());
        let analysis = Analysis::leaf(env.alloc(), NodeKind::Constant, label, NodeState::Ready(ReadyState::Ok), None);
        (Output::Ok(self.value.clone()), analysis)
    }
}

// ---- Fail ----

struct FailNode<T> {
    msg: Msg,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Eval<T> for FailNode<T> {
    fn eval(&self, env: &mut Env) -> (Output<T>, Analysis) {
        let analysis = Analysis::leaf(
            env.alloc(),
            NodeKind::Failed,
            self.msg.to_string(),
            NodeState::Ready(ReadyState::Err),
            None,
        );
        (Output::Error(self.msg.clone()), analysis)
    }
}

// ---- Active ----

struct ActiveNode<T> {
    reason: Active,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Eval<T> for ActiveNode<T> {
    fn eval(&self, env: &mut Env) -> (Output<T>, Analysis) {
        let state = match &self.reason {
            Active::Running(_) => NodeState::Active(ActiveState::Running),
            Active::ReadyToRerun(_) => NodeState::Active(ActiveState::ReadyToRerun),
        };
        let analysis = Analysis::leaf(env.alloc(), NodeKind::Active, self.reason.to_string(), state, None);
        (Output::Active(self.reason.clone()), analysis)
    }
}

// ---- Primitive ----

struct PrimitiveNode<T> {
    input: Input<T>,
    description: String,
}

impl<T: Clone + Send + Sync + 'static> Eval<T> for PrimitiveNode<T> {
    fn eval(&self, env: &mut Env) -> (Output<T>, Analysis) {
        env.register_dependency(self.input.id());
        env.register_subscribable(Arc::new(self.input.clone()));
        let (value, job_id) = self.input.get();
        let state = state_of(&value);
        let analysis = Analysis::leaf(env.alloc(), NodeKind::Primitive, self.description.clone(), state, job_id);
        (value, analysis)
    }
}

// ---- Map ----

struct MapNode<U, T> {
    inner: Term<U>,
    f: Arc<dyn Fn(U) -> T + Send + Sync>,
}

impl<U: Clone + Send + Sync + 'static, T> Eval<T> for MapNode<U, T> {
    fn eval(&self, env: &mut Env) -> (Output<T>, Analysis) {
        let (ou, au) = env.cached_eval(&self.inner);
        let out = ou.map(|v| (self.f)(v));
        let state = state_of(&out);
        let analysis = Analysis::compose(env.alloc(), NodeKind::Map, "map", state, None, vec![(au, false)]);
        (out, analysis)
    }
}

// ---- Pair ----

struct PairNode<A, B> {
    a: Term<A>,
    b: Term<B>,
}

impl<A: Clone + Send + Sync + 'static, B: Clone + Send + Sync + 'static> Eval<(A, B)> for PairNode<A, B> {
    fn eval(&self, env: &mut Env) -> (Output<(A, B)>, Analysis) {
        let (oa, aa) = env.cached_eval(&self.a);
        let (ob, ab) = env.cached_eval(&self.b);
        let out = match (&oa, &ob) {
            (Output::Ok(va), Output::Ok(vb)) => Output::Ok((va.clone(), vb.clone())),
            _ => match aggregate([&oa.map_ref(), &ob.map_ref()]) {
                Aggregate::Error(m) => Output::Error(m),
                Aggregate::Active(a) => Output::Active(a),
                Aggregate::AllOk => unreachable!("both sides Ok handled above"),
            },
        };
        let state = state_of(&out);
        let analysis = Analysis::compose(env.alloc(), NodeKind::Pair, "pair", state, None, vec![(aa, false), (ab, false)]);
        (out, analysis)
    }
}

// `aggregate` wants `&Output<T>` for a uniform element type; Pair's two
// sides have unrelated payload types, so we erase the payload to `()`
// before aggregating (only the variant tag matters for this combination
// rule).
trait ErasedStatus {
    fn map_ref(&self) -> Output<()>;
}
impl<T> ErasedStatus for Output<T> {
    fn map_ref(&self) -> Output<()> {
        match self {
            Output::Ok(_) => Output::Ok(()),
            Output::Active(a) => Output::Active(a.clone()),
            Output::Error(m) => Output::Error(m.clone()),
        }
    }
}

// ---- Bind ----

struct BindNode<U, T> {
    inner: Term<U>,
    f: Arc<dyn Fn(U) -> Term<T> + Send + Sync>,
    description: String,
}

impl<U: Clone + Send + Sync + 'static, T: Clone + Send + Sync + 'static> Eval<T> for BindNode<U, T> {
    fn eval(&self, env: &mut Env) -> (Output<T>, Analysis) {
        let (ou, au) = env.cached_eval(&self.inner);
        match ou {
            Output::Ok(v) => {
                let y = (self.f)(v);
                let (oy, ay) = env.cached_eval(&y);
                let state = state_of(&oy);
                let analysis = Analysis::compose(
                    env.alloc(),
                    NodeKind::Bind,
                    self.description.clone(),
                    state,
                    None,
                    vec![(au, true), (ay, false)],
                );
                (oy, analysis)
            }
            Output::Active(a) => {
                let analysis = Analysis::compose(
                    env.alloc(),
                    NodeKind::Bind,
                    self.description.clone(),
                    NodeState::Blocked,
                    None,
                    vec![(au, true)],
                );
                (Output::Active(a), analysis)
            }
            Output::Error(m) => {
                let analysis = Analysis::compose(
                    env.alloc(),
                    NodeKind::Bind,
                    self.description.clone(),
                    NodeState::Blocked,
                    None,
                    vec![(au, true)],
                );
                (Output::Error(m), analysis)
            }
        }
    }
}

// ---- BindInput ----

struct BindInputNode<U, T> {
    inner: Term<U>,
    f: Arc<dyn Fn(U) -> Input<T> + Send + Sync>,
    description: String,
}

impl<U: Clone + Send + Sync + 'static, T: Clone + Send + Sync + 'static> Eval<T> for BindInputNode<U, T> {
    fn eval(&self, env: &mut Env) -> (Output<T>, Analysis) {
        let (ou, au) = env.cached_eval(&self.inner);
        match ou {
            Output::Ok(v) => {
                let input = (self.f)(v);
                env.register_dependency(input.id());
                env.register_subscribable(Arc::new(input.clone()));
                let (value, job_id) = input.get();
                let state = state_of(&value);
                let read_node = Analysis::leaf(env.alloc(), NodeKind::Primitive, "read", state, job_id);
                let analysis = Analysis::compose(
                    env.alloc(),
                    NodeKind::Bind,
                    self.description.clone(),
                    state,
                    None,
                    vec![(au, true), (read_node, false)],
                );
                (value, analysis)
            }
            Output::Active(a) => {
                let analysis = Analysis::compose(
                    env.alloc(),
                    NodeKind::Bind,
                    self.description.clone(),
                    NodeState::Blocked,
                    None,
                    vec![(au, true)],
                );
                (Output::Active(a), analysis)
            }
            Output::Error(m) => {
                let analysis = Analysis::compose(
                    env.alloc(),
                    NodeKind::Bind,
                    self.description.clone(),
                    NodeState::Blocked,
                    None,
                    vec![(au, true)],
                );
                (Output::Error(m), analysis)
            }
        }
    }
}

// ---- State ----

struct StateNode<T> {
    inner: Term<T>,
}

impl<T: Clone + Send + Sync + 'static> Eval<Output<T>> for StateNode<T> {
    fn eval(&self, env: &mut Env) -> (Output<Output<T>>, Analysis) {
        let (ot, at) = env.cached_eval(&self.inner);
        let analysis = Analysis::compose(env.alloc(), NodeKind::State, "state", NodeState::Ready(ReadyState::Ok), None, vec![(at, false)]);
        (Output::Ok(ot), analysis)
    }
}

// ---- Catch ----

struct CatchNode<T> {
    inner: Term<T>,
}

impl<T: Clone + Send + Sync + 'static> Eval<Output<T>> for CatchNode<T> {
    fn eval(&self, env: &mut Env) -> (Output<Output<T>>, Analysis) {
        let (ot, at) = env.cached_eval(&self.inner);
        let out = match ot {
            Output::Ok(v) => Output::Ok(Output::Ok(v)),
            Output::Error(m) => Output::Ok(Output::Error(m)),
            Output::Active(a) => Output::Active(a),
        };
        let state = state_of(&out);
        let analysis = Analysis::compose(env.alloc(), NodeKind::Catch, "catch", state, None, vec![(at, false)]);
        (out, analysis)
    }
}

// ---- Gate ----

struct GateNode<T> {
    ctrl: Term<()>,
    inner: Term<T>,
}

impl<T: Clone + Send + Sync + 'static> Eval<T> for GateNode<T> {
    fn eval(&self, env: &mut Env) -> (Output<T>, Analysis) {
        // Both sides are evaluated unconditionally, so the analysis graph
        // always shows the full shape regardless of which side is blocking.
        let (oc, ac) = env.cached_eval(&self.ctrl);
        let (ox, ax) = env.cached_eval(&self.inner);
        let out = match oc {
            Output::Ok(()) => ox,
            Output::Active(a) => Output::Active(a),
            Output::Error(m) => Output::Error(m),
        };
        let state = state_of(&out);
        let analysis = Analysis::compose(env.alloc(), NodeKind::Gate, "gate", state, None, vec![(ac, false), (ax, false)]);
        (out, analysis)
    }
}

// ---- All ----

struct AllNode {
    terms: Vec<Term<()>>,
}

impl Eval<()> for AllNode {
    fn eval(&self, env: &mut Env) -> (Output<()>, Analysis) {
        let evaluated: Vec<(Output<()>, Analysis)> = self.terms.iter().map(|t| env.cached_eval(t)).collect();
        let outputs: Vec<&Output<()>> = evaluated.iter().map(|(o, _)| o).collect();
        let out = match aggregate(outputs) {
            Aggregate::AllOk => Output::Ok(()),
            Aggregate::Active(a) => Output::Active(a),
            Aggregate::Error(m) => Output::Error(concat_errors(&evaluated, m)),
        };
        let state = state_of(&out);
        let children = evaluated.into_iter().map(|(_, a)| (a, false)).collect();
        let analysis = Analysis::compose(env.alloc(), NodeKind::All, "all", state, None, children);
        (out, analysis)
    }
}

/// If any child errored, the combined node's message concatenates the
/// first few of those errors rather than picking just one.
fn concat_errors(evaluated: &[(Output<()>, Analysis)], first: Msg) -> Msg {
    let mut messages = vec![first.to_string()];
    for (o, _) in evaluated {
        if let Output::Error(m) = o {
            if !messages.contains(&m.to_string()) {
                messages.push(m.to_string());
            }
        }
        if messages.len() >= 3 {
            break;
        }
    }
    Msg::new(messages.join("; "))
}

// ---- Component ----

struct ComponentNode<T> {
    inner: Term<T>,
    description: String,
}

impl<T: Clone + Send + Sync + 'static> Eval<T> for ComponentNode<T> {
    fn eval(&self, env: &mut Env) -> (Output<T>, Analysis) {
        let (o, a) = env.cached_eval(&self.inner);
        (o, a.relabel_root(self.description.clone()))
    }
}

// ---- ListMap ----

struct ListMapNode<A, B> {
    pp: Arc<dyn Fn(&A) -> String + Send + Sync>,
    xs: Term<Vec<A>>,
    f: Arc<dyn Fn(A) -> Term<B> + Send + Sync>,
}

impl<A: Clone + Send + Sync + 'static, B: Clone + Send + Sync + 'static> Eval<Vec<B>> for ListMapNode<A, B> {
    fn eval(&self, env: &mut Env) -> (Output<Vec<B>>, Analysis) {
        let (oxs, axs) = env.cached_eval(&self.xs);
        match oxs {
            Output::Ok(items) => {
                let mut children = vec![(axs, true)];
                let mut evaluated = Vec::with_capacity(items.len());
                for item in items {
                    let label = (self.pp)(&item);
                    let item_term = (self.f)(item);
                    let (oi, ai) = env.cached_eval(&item_term);
                    children.push((ai.relabel_root(label), false));
                    evaluated.push(oi);
                }
                let refs: Vec<&Output<B>> = evaluated.iter().collect();
                let out = match aggregate(refs) {
                    Aggregate::AllOk => Output::Ok(evaluated.into_iter().map(|o| match o {
                        Output::Ok(v) => v,
                        _ => unreachable!("AllOk implies every element was Ok"),
                    }).collect()),
                    Aggregate::Active(a) => Output::Active(a),
                    Aggregate::Error(m) => Output::Error(m),
                };
                let state = state_of(&out);
                let analysis = Analysis::compose(env.alloc(), NodeKind::ListMap, "list_map", state, None, children);
                (out, analysis)
            }
            Output::Active(a) => {
                let analysis = Analysis::compose(env.alloc(), NodeKind::ListMap, "list_map", NodeState::Active(active_state(&a)), None, vec![(axs, true)]);
                (Output::Active(a), analysis)
            }
            Output::Error(m) => {
                let analysis = Analysis::compose(env.alloc(), NodeKind::ListMap, "list_map", NodeState::Ready(ReadyState::Err), None, vec![(axs, true)]);
                (Output::Error(m), analysis)
            }
        }
    }
}

fn active_state(a: &Active) -> ActiveState {
    match a {
        Active::Running(_) => ActiveState::Running,
        Active::ReadyToRerun(_) => ActiveState::ReadyToRerun,
    }
}

// ---- Public constructors and combinators ----

impl<T: Clone + Send + Sync + 'static> Term<T> {
    pub fn from_value(value: T) -> Self {
        Term(Arc::new(ReturnNode { value, label: None }))
    }

    pub fn from_value_labeled(value: T, label: impl Into<String>) -> Self {
        Term(Arc::new(ReturnNode {
            value,
            label: Some(label.into()),
        }))
    }

    pub fn fail(msg: impl Into<Msg>) -> Self {
        Term(Arc::new(FailNode {
            msg: msg.into(),
            _marker: PhantomData,
        }))
    }

    pub fn active(reason: Active) -> Self {
        Term(Arc::new(ActiveNode {
            reason,
            _marker: PhantomData,
        }))
    }

    pub fn primitive(input: Input<T>, description: impl Into<String>) -> Self {
        Term(Arc::new(PrimitiveNode {
            input,
            description: description.into(),
        }))
    }

    pub fn map<U>(self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Term<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        Term(Arc::new(MapNode { inner: self, f: Arc::new(f) }))
    }

    pub fn bind<U>(self, description: impl Into<String>, f: impl Fn(T) -> Term<U> + Send + Sync + 'static) -> Term<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        Term(Arc::new(BindNode {
            inner: self,
            f: Arc::new(f),
            description: description.into(),
        }))
    }

    pub fn bind_input<U>(self, description: impl Into<String>, f: impl Fn(T) -> Input<U> + Send + Sync + 'static) -> Term<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        Term(Arc::new(BindInputNode {
            inner: self,
            f: Arc::new(f),
            description: description.into(),
        }))
    }

    pub fn pair<U>(self, other: Term<U>) -> Term<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        Term(Arc::new(PairNode { a: self, b: other }))
    }

    pub fn gate(self, ctrl: Term<()>) -> Term<T> {
        Term(Arc::new(GateNode { ctrl, inner: self }))
    }

    pub fn state(self) -> Term<Output<T>> {
        Term(Arc::new(StateNode { inner: self }))
    }

    pub fn catch(self) -> Term<Output<T>> {
        Term(Arc::new(CatchNode { inner: self }))
    }

    pub fn component(self, description: impl Into<String>) -> Self {
        Term(Arc::new(ComponentNode {
            inner: self,
            description: description.into(),
        }))
    }

    /// Evaluate this term against the inputs' current state. Returns the
    /// status, the dependency graph built while computing it, and the
    /// set of inputs this pass actually read — the contract from spec
    /// section 4.4: `evaluation returns (Output, Analysis, Set<Input>)`.
    pub fn eval(&self) -> (Output<T>, Analysis, HashSet<InputId>) {
        let mut env = Env::new();
        let (out, analysis) = self.0.eval(&mut env);
        (out, analysis, env.depends_on)
    }

    /// As `eval`, but also returns type-erased handles onto every input
    /// this pass read, for a caller (the engine) that needs to subscribe
    /// to "anything changed" without being generic over each input's
    /// payload type.
    pub fn eval_with_subscriptions(&self) -> (Output<T>, Analysis, Vec<Arc<dyn AnySubscribe>>) {
        let mut env = Env::new();
        let (out, analysis) = self.0.eval(&mut env);
        (out, analysis, env.subs)
    }
}

impl Term<()> {
    pub fn all(terms: Vec<Term<()>>) -> Term<()> {
        Term(Arc::new(AllNode { terms }))
    }
}

impl<A: Clone + Send + Sync + 'static> Term<Vec<A>> {
    pub fn list_map<B: Clone + Send + Sync + 'static>(
        self,
        pp: impl Fn(&A) -> String + Send + Sync + 'static,
        f: impl Fn(A) -> Term<B> + Send + Sync + 'static,
    ) -> Term<Vec<B>> {
        Term(Arc::new(ListMapNode {
            pp: Arc::new(pp),
            xs: self,
            f: Arc::new(f),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::NodeKind;

    #[test]
    fn s1_constant_pipeline() {
        let term = Term::from_value_labeled(42, "42");
        let (out, analysis, deps) = term.eval();
        assert_eq!(out, Output::Ok(42));
        assert!(deps.is_empty());
        assert_eq!(analysis.nodes().len(), 1);
        assert_eq!(analysis.root_node().kind, NodeKind::Constant);
        assert_eq!(analysis.root_node().label, "42");
    }

    #[test]
    fn map_preserves_active() {
        let term = Term::<i32>::active(Active::Running("waiting".into())).map(|v| v + 1);
        let (out, _analysis, _deps) = term.eval();
        assert_eq!(out, Output::Active(Active::Running("waiting".into())));
    }

    #[test]
    fn pair_is_ok_only_if_both_sides_ok() {
        let both_ok = Term::from_value(1).pair(Term::from_value("a"));
        assert_eq!(both_ok.eval().0, Output::Ok((1, "a")));

        let one_failed = Term::from_value(1).pair(Term::<&str>::fail("boom"));
        assert_eq!(one_failed.eval().0, Output::Error(Msg::new("boom")));

        let one_active = Term::from_value(1).pair(Term::<&str>::active(Active::Running("x".into())));
        assert_eq!(one_active.eval().0, Output::Active(Active::Running("x".into())));
    }

    #[test]
    fn s3_bind_gating_blocks_on_non_ok_and_skips_continuation() {
        let called = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called2 = called.clone();
        let ctrl = Term::<bool>::active(Active::Running("ci pending".into()));
        let term = ctrl.bind("choose branch", move |n| {
            called2.store(true, std::sync::atomic::Ordering::SeqCst);
            if n { Term::from_value(1) } else { Term::from_value(2) }
        });

        let (out, analysis, _deps) = term.eval();
        assert_eq!(out, Output::Active(Active::Running("ci pending".into())));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst), "continuation must not run while blocked");
        assert_eq!(analysis.root_node().kind, NodeKind::Bind);
        assert!(matches!(analysis.root_node().state, NodeState::Blocked));
        // Only the static edge exists; no dynamic child.
        assert_eq!(analysis.edges().iter().filter(|e| e.from == analysis.root()).count(), 1);
    }

    #[test]
    fn catch_law() {
        let ok = Term::from_value(1).catch();
        assert_eq!(ok.eval().0, Output::Ok(Output::Ok(1)));

        let err = Term::<i32>::fail("bad").catch();
        assert_eq!(err.eval().0, Output::Ok(Output::Error(Msg::new("bad"))));

        let active = Term::<i32>::active(Active::Running("x".into())).catch();
        assert_eq!(active.eval().0, Output::Active(Active::Running("x".into())));
    }

    #[test]
    fn gate_law() {
        let ctrl_ok = Term::from_value(());
        let gated = Term::from_value(99).gate(ctrl_ok);
        assert_eq!(gated.eval().0, Output::Ok(99));

        let ctrl_blocked = Term::<()>::active(Active::Running("waiting".into()));
        let gated2 = Term::from_value(99).gate(ctrl_blocked);
        assert_eq!(gated2.eval().0, Output::Active(Active::Running("waiting".into())));
    }

    #[test]
    fn list_map_preserves_order() {
        let xs = Term::from_value(vec![1, 2, 3]);
        let mapped = xs.list_map(|n| format!("item-{n}"), |n| Term::from_value(n * 10));
        assert_eq!(mapped.eval().0, Output::Ok(vec![10, 20, 30]));
    }

    #[test]
    fn all_succeeds_iff_all_ok() {
        let all_ok = Term::all(vec![Term::from_value(()), Term::from_value(())]);
        assert_eq!(all_ok.eval().0, Output::Ok(()));

        let one_fails = Term::all(vec![Term::from_value(()), Term::fail("nope")]);
        assert!(one_fails.eval().0.is_error());

        let one_active = Term::all(vec![Term::from_value(()), Term::active(Active::Running("x".into()))]);
        assert!(one_active.eval().0.is_active());
    }

    #[test]
    fn determinism_same_inputs_same_analysis() {
        let build = || {
            let xs = Term::from_value(vec![1, 2]);
            xs.list_map(|n| format!("{n}"), |n| Term::from_value(n * 2))
        };
        let (o1, a1, _) = build().eval();
        let (o2, a2, _) = build().eval();
        assert_eq!(o1, o2);
        let ids1: Vec<_> = a1.nodes().iter().map(|n| n.id).collect();
        let ids2: Vec<_> = a2.nodes().iter().map(|n| n.id).collect();
        assert_eq!(ids1, ids2);
    }

    #[test]
    fn dependency_completeness_primitive_registers_input() {
        let input: Input<i32> = Input::new(Output::ok(7));
        let term = Term::primitive(input.clone(), "seven");
        let (out, _analysis, deps) = term.eval();
        assert_eq!(out, Output::Ok(7));
        assert_eq!(deps.len(), 1);
        assert!(deps.contains(&input.id()));
    }

    #[test]
    fn shared_subterm_by_value_identity_shares_one_node() {
        let shared = Term::from_value(1);
        let term = shared.clone().pair(shared.clone()).map(|(a, b)| a + b);
        let (out, analysis, _deps) = term.eval();
        assert_eq!(out, Output::Ok(2));

        let constant_nodes: Vec<_> = analysis.nodes().iter().filter(|n| n.kind == NodeKind::Constant).collect();
        assert_eq!(constant_nodes.len(), 1, "the two occurrences of `shared` must collapse onto one node");

        let pair_node = analysis.nodes().iter().find(|n| n.kind == NodeKind::Pair).unwrap();
        let edges_into_shared = analysis.edges().iter().filter(|e| e.from == pair_node.id && e.to == constant_nodes[0].id).count();
        assert_eq!(edges_into_shared, 1, "pair has two children pointing at the same node, not two nodes");
    }

    #[test]
    fn shared_primitive_input_is_read_and_registered_once() {
        let input: Input<i32> = Input::new(Output::ok(5));
        let primitive = Term::primitive(input.clone(), "five");
        let term = primitive.clone().pair(primitive.clone());
        let (out, analysis, deps) = term.eval();
        assert_eq!(out, Output::Ok((5, 5)));
        assert_eq!(deps.len(), 1);
        assert_eq!(analysis.nodes().iter().filter(|n| n.kind == NodeKind::Primitive).count(), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        // Property 1 (purity): evaluating the same term twice against
        // unchanged inputs yields an equal status and a structurally
        // identical analysis, for any term built from arbitrary constants.
        proptest! {
            #[test]
            fn purity_same_term_same_state_same_result(n in any::<i32>(), offset in any::<i32>()) {
                let build = || Term::from_value(n).map(move |v| v.wrapping_add(offset));
                let (out1, analysis1, _) = build().eval();
                let (out2, analysis2, _) = build().eval();
                prop_assert_eq!(out1, out2);
                let ids1: Vec<_> = analysis1.nodes().iter().map(|node| node.id).collect();
                let ids2: Vec<_> = analysis2.nodes().iter().map(|node| node.id).collect();
                prop_assert_eq!(ids1, ids2);
            }
        }

        // Property 5 (Catch law): `catch` never itself fails or blocks —
        // it reifies the inner term's status as a value, Active passing
        // through untouched.
        proptest! {
            #[test]
            fn catch_law_holds_for_any_inner_outcome(
                value in any::<i32>(),
                msg in "[a-z ]{0,20}",
                running in "[a-z ]{0,20}",
            ) {
                let ok = Term::from_value(value).catch();
                prop_assert_eq!(ok.eval().0, Output::Ok(Output::Ok(value)));

                let err = Term::<i32>::fail(msg.clone()).catch();
                prop_assert_eq!(err.eval().0, Output::Ok(Output::Error(Msg::new(msg))));

                let active = Term::<i32>::active(Active::Running(running.clone())).catch();
                prop_assert_eq!(active.eval().0, Output::Active(Active::Running(running)));
            }
        }

        // Property 6 (Gate law): a gated term takes its controlling
        // term's status whenever that status is not `Ok`, and otherwise
        // takes its own.
        proptest! {
            #[test]
            fn gate_law_holds_for_any_control_and_value(
                value in any::<i32>(),
                blocked_reason in "[a-z ]{0,20}",
                error_msg in "[a-z ]{0,20}",
            ) {
                let via_ok_ctrl = Term::from_value(value).gate(Term::from_value(()));
                prop_assert_eq!(via_ok_ctrl.eval().0, Output::Ok(value));

                let via_active_ctrl = Term::from_value(value).gate(Term::active(Active::Running(blocked_reason.clone())));
                prop_assert_eq!(via_active_ctrl.eval().0, Output::Active(Active::Running(blocked_reason)));

                let via_failed_ctrl = Term::from_value(value).gate(Term::fail(error_msg.clone()));
                prop_assert_eq!(via_failed_ctrl.eval().0, Output::Error(Msg::new(error_msg)));
            }
        }

        // Property 7 (ListMap ordering): mapping over a list never
        // reorders results, for any list of inputs.
        proptest! {
            #[test]
            fn list_map_preserves_order_for_any_input(xs in prop::collection::vec(any::<i32>(), 0..30)) {
                let expected: Vec<i32> = xs.iter().map(|n| n.wrapping_mul(2)).collect();
                let term = Term::from_value(xs).list_map(|n| format!("item-{n}"), |n| Term::from_value(n.wrapping_mul(2)));
                prop_assert_eq!(term.eval().0, Output::Ok(expected));
            }
        }
    }
}
