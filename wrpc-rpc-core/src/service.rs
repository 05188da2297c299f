use std::collections::BTreeSet;

/// 以类型标识远程服务
///
/// ```ignore
/// struct MessageService;
///
/// impl ServiceIface for MessageService {
///     const NAME: &'static str = "MessageService";
///     const METHODS: &'static [&'static str] = &["sendSMS", "sendEmail"];
/// }
/// ```
pub trait ServiceIface {
    const NAME: &'static str;
    const METHODS: &'static [&'static str];
    /// 实验性质的服务，客户端拒绝为它创建连接
    const UNCHECKED: bool = false;
}

/// 远程服务描述：服务名加上可调用的方法集合
///
/// 方法集合为空表示不做方法校验，任何方法名都交给服务端判断。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    name: String,
    methods: BTreeSet<String>,
    unchecked: bool,
}

impl ServiceDescriptor {
    pub fn new<I, M>(name: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        Self {
            name: name.into(),
            methods: methods.into_iter().map(Into::into).collect(),
            unchecked: false,
        }
    }

    /// 不限制方法的描述
    pub fn open(name: impl Into<String>) -> Self {
        Self::new(name, std::iter::empty::<String>())
    }

    pub fn of<S: ServiceIface>() -> Self {
        let mut descriptor = Self::new(S::NAME, S::METHODS.iter().copied());
        descriptor.unchecked = S::UNCHECKED;
        descriptor
    }

    /// 标记为实验性质
    pub fn unchecked(mut self) -> Self {
        self.unchecked = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }

    pub fn is_unchecked(&self) -> bool {
        self.unchecked
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }
}
